// Age and sex personalized normal ranges

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::clinical_metrics::{MetricName, NormalRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgeGroup {
    /// 15 and under
    Child,
    /// 16 to 25
    YoungAdult,
    /// 26 to 40
    Adult,
    /// 41 and over
    MiddleAged,
}

impl AgeGroup {
    pub fn from_age(age: u32) -> Self {
        match age {
            0..=15 => AgeGroup::Child,
            16..=25 => AgeGroup::YoungAdult,
            26..=40 => AgeGroup::Adult,
            _ => AgeGroup::MiddleAged,
        }
    }

    /// Ordinal used in the classifier feature vector (1..=4)
    pub const fn ordinal(self) -> u8 {
        match self {
            AgeGroup::Child => 1,
            AgeGroup::YoungAdult => 2,
            AgeGroup::Adult => 3,
            AgeGroup::MiddleAged => 4,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            AgeGroup::Child => "child",
            AgeGroup::YoungAdult => "young_adult",
            AgeGroup::Adult => "adult",
            AgeGroup::MiddleAged => "middle_aged",
        }
    }

    const fn row(self) -> usize {
        self.ordinal() as usize - 1
    }
}

impl fmt::Display for AgeGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Sex {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
    #[default]
    #[serde(rename = "U")]
    Unknown,
}

impl Sex {
    pub const fn code(self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
            Sex::Unknown => "U",
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Sex::Male => "male",
            Sex::Female => "female",
            Sex::Unknown => "unspecified sex",
        }
    }

    /// Feature encoding: M 1, F 2, unknown 1.5
    pub const fn encoded(self) -> f64 {
        match self {
            Sex::Male => 1.0,
            Sex::Female => 2.0,
            Sex::Unknown => 1.5,
        }
    }

    const fn column(self) -> usize {
        match self {
            Sex::Male => 0,
            Sex::Female => 1,
            Sex::Unknown => 2,
        }
    }
}

impl fmt::Display for Sex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Sex {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "M" | "MALE" => Ok(Sex::Male),
            "F" | "FEMALE" => Ok(Sex::Female),
            "U" | "UNKNOWN" | "" => Ok(Sex::Unknown),
            other => Err(format!("unknown sex '{}', expected M, F or U", other)),
        }
    }
}

type Table = [[(f64, f64); 3]; 4];

// Rows: age group. Columns: male, female, default.
const ANB_NORMS: Table = [
    [(1.0, 5.0), (1.5, 5.5), (1.0, 5.0)],
    [(0.5, 4.0), (1.0, 4.5), (0.5, 4.5)],
    [(0.0, 3.5), (0.5, 4.0), (0.0, 4.0)],
    [(-0.5, 3.0), (0.0, 3.5), (-0.5, 3.5)],
];

const SNA_NORMS: Table = [
    [(78.0, 86.0), (79.0, 87.0), (78.0, 87.0)],
    [(79.0, 85.0), (80.0, 86.0), (79.0, 86.0)],
    [(80.0, 84.0), (81.0, 85.0), (80.0, 85.0)],
    [(81.0, 83.0), (82.0, 84.0), (81.0, 84.0)],
];

const SNB_NORMS: Table = [
    [(75.0, 83.0), (76.0, 84.0), (75.0, 84.0)],
    [(76.0, 82.0), (77.0, 83.0), (76.0, 83.0)],
    [(78.0, 82.0), (79.0, 83.0), (78.0, 83.0)],
    [(79.0, 81.0), (80.0, 82.0), (79.0, 82.0)],
];

const FMA_NORMS: Table = [
    [(22.0, 32.0), (23.0, 33.0), (22.0, 33.0)],
    [(23.0, 31.0), (24.0, 32.0), (23.0, 32.0)],
    [(25.0, 30.0), (26.0, 31.0), (25.0, 31.0)],
    [(26.0, 29.0), (27.0, 30.0), (26.0, 30.0)],
];

/// Normal range for `metric` personalized by age bracket and sex.
/// Unknown sex uses the bracket's default column.
pub fn personalized_range(metric: MetricName, age: u32, sex: Sex) -> NormalRange {
    let table = match metric {
        MetricName::Anb => &ANB_NORMS,
        MetricName::Sna => &SNA_NORMS,
        MetricName::Snb => &SNB_NORMS,
        MetricName::Fma => &FMA_NORMS,
    };
    let (min, max) = table[AgeGroup::from_age(age).row()][sex.column()];
    NormalRange::new(min, max)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Below,
    Within,
    Above,
}

/// Distance outside the range in units of range width.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Deviation {
    pub magnitude: f64,
    pub direction: Direction,
}

pub fn personalized_deviation(value: f64, range: NormalRange) -> Deviation {
    let width = range.width();
    if value < range.min {
        Deviation { magnitude: (range.min - value) / width, direction: Direction::Below }
    } else if value > range.max {
        Deviation { magnitude: (value - range.max) / width, direction: Direction::Above }
    } else {
        Deviation { magnitude: 0.0, direction: Direction::Within }
    }
}
