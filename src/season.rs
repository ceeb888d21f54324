use std::fmt;

use anyhow::{Result, anyhow};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// An NBA season such as `2024-25`, identified by its starting year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Season {
    start_year: i32,
}

impl Season {
    pub fn from_start_year(start_year: i32) -> Self {
        Self { start_year }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let (start, end) = trimmed
            .split_once('-')
            .ok_or_else(|| anyhow!("season {trimmed:?} is not in YYYY-YY form"))?;
        let start_year = start
            .parse::<i32>()
            .map_err(|_| anyhow!("season {trimmed:?} has a bad start year"))?;
        let end_suffix = end
            .parse::<i32>()
            .map_err(|_| anyhow!("season {trimmed:?} has a bad end year"))?;
        if start.len() != 4 || end.len() != 2 || (start_year + 1) % 100 != end_suffix {
            return Err(anyhow!("season {trimmed:?} does not span consecutive years"));
        }
        Ok(Self { start_year })
    }

    /// Season in progress on `today`; October opens a new season.
    pub fn current(today: NaiveDate) -> Self {
        if today.month() >= 10 {
            Self::from_start_year(today.year())
        } else {
            Self::from_start_year(today.year() - 1)
        }
    }

    pub fn start_year(&self) -> i32 {
        self.start_year
    }

    /// The stored `year` key uses the ending year (2025 for 2024-25).
    pub fn end_year(&self) -> i32 {
        self.start_year + 1
    }

    pub fn next(&self) -> Self {
        Self::from_start_year(self.start_year + 1)
    }

    pub fn range(from: Season, to: Season) -> Vec<Season> {
        (from.start_year..=to.start_year)
            .map(Season::from_start_year)
            .collect()
    }
}

impl fmt::Display for Season {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.start_year, (self.start_year + 1) % 100)
    }
}

impl TryFrom<String> for Season {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Season::parse(&value)
    }
}

impl From<Season> for String {
    fn from(value: Season) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SeasonType {
    RegularSeason,
    Playoffs,
    PlayIn,
}

pub struct SeasonTypeConfig {
    pub season_type: SeasonType,
    pub name: &'static str,
    pub season_code: i64,
    pub minimum_season: Option<i32>,
}

const SEASON_TYPES: &[SeasonTypeConfig] = &[
    SeasonTypeConfig {
        season_type: SeasonType::RegularSeason,
        name: "Regular Season",
        season_code: 1,
        minimum_season: None,
    },
    SeasonTypeConfig {
        season_type: SeasonType::Playoffs,
        name: "Playoffs",
        season_code: 2,
        minimum_season: None,
    },
    SeasonTypeConfig {
        season_type: SeasonType::PlayIn,
        name: "PlayIn",
        season_code: 3,
        minimum_season: Some(2020),
    },
];

impl SeasonType {
    pub const ALL: [SeasonType; 3] = [
        SeasonType::RegularSeason,
        SeasonType::Playoffs,
        SeasonType::PlayIn,
    ];

    pub fn config(self) -> &'static SeasonTypeConfig {
        match self {
            SeasonType::RegularSeason => &SEASON_TYPES[0],
            SeasonType::Playoffs => &SEASON_TYPES[1],
            SeasonType::PlayIn => &SEASON_TYPES[2],
        }
    }

    /// Name the stats provider expects in its `SeasonType` parameter.
    pub fn api_name(self) -> &'static str {
        self.config().name
    }

    pub fn code(self) -> i64 {
        self.config().season_code
    }

    pub fn minimum_season(self) -> Option<Season> {
        self.config().minimum_season.map(Season::from_start_year)
    }

    pub fn from_code(code: i64) -> Option<Self> {
        SEASON_TYPES
            .iter()
            .find(|cfg| cfg.season_code == code)
            .map(|cfg| cfg.season_type)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let norm = raw.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
        match norm.as_str() {
            "1" | "regular" | "regularseason" => Some(SeasonType::RegularSeason),
            "2" | "playoffs" | "playoff" => Some(SeasonType::Playoffs),
            "3" | "playin" => Some(SeasonType::PlayIn),
            _ => None,
        }
    }
}

impl fmt::Display for SeasonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.api_name())
    }
}

/// Latest of the given floors; `None` when nothing restricts the season.
pub fn effective_floor(floors: impl IntoIterator<Item = Option<Season>>) -> Option<Season> {
    floors.into_iter().flatten().max()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{Season, SeasonType, effective_floor};

    #[test]
    fn parses_and_formats_seasons() {
        let season = Season::parse("1999-00").expect("century rollover parses");
        assert_eq!(season.start_year(), 1999);
        assert_eq!(season.end_year(), 2000);
        assert_eq!(season.to_string(), "1999-00");
        assert!(Season::parse("2019-21").is_err());
        assert!(Season::parse("2019").is_err());
    }

    #[test]
    fn current_season_turns_over_in_october() {
        let sept = NaiveDate::from_ymd_opt(2025, 9, 30).unwrap();
        let oct = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        assert_eq!(Season::current(sept).to_string(), "2024-25");
        assert_eq!(Season::current(oct).to_string(), "2025-26");
    }

    #[test]
    fn floor_is_latest_restriction() {
        let floor = effective_floor([
            Some(Season::parse("2013-14").unwrap()),
            SeasonType::PlayIn.minimum_season(),
            None,
        ]);
        assert_eq!(floor, Some(Season::parse("2020-21").unwrap()));
        assert_eq!(effective_floor([None, None]), None);
    }

    #[test]
    fn season_type_codes_round_trip() {
        for st in SeasonType::ALL {
            assert_eq!(SeasonType::from_code(st.code()), Some(st));
        }
        assert_eq!(SeasonType::parse("Play-In"), Some(SeasonType::PlayIn));
        assert_eq!(SeasonType::parse("regular season"), Some(SeasonType::RegularSeason));
    }
}
