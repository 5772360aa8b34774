use serde::{Deserialize, Serialize};

use crate::constants::MAX_BRISKS;
use crate::score::ScoreError;

/// Scoring variant of the game. Decides the point buttons and how much each brisk is worth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Classic,
    Turkish,
}

const CLASSIC_POINTS: [i64; 8] = [10, 20, 40, 60, 80, 100, 250, 500];
const TURKISH_POINTS: [i64; 16] = [
    20, 40, 50, 60, 80, 100, 150, 200, 250, 300, 400, 500, 600, 800, 1000, 1500,
];

impl Variant {
    pub const ALL: [Variant; 2] = [Variant::Classic, Variant::Turkish];

    pub fn id(&self) -> &'static str {
        match self {
            Variant::Classic => "classic",
            Variant::Turkish => "turkish",
        }
    }

    pub fn from_id(id: &str) -> Option<Variant> {
        let id = id.trim().to_ascii_lowercase();
        Variant::ALL.into_iter().find(|variant| variant.id() == id)
    }

    /// Unknown ids fall back to the default variant
    pub fn from_id_or_default(id: &str) -> Variant {
        Variant::from_id(id).unwrap_or_default()
    }

    pub fn point_values(&self) -> &'static [i64] {
        match self {
            Variant::Classic => &CLASSIC_POINTS,
            Variant::Turkish => &TURKISH_POINTS,
        }
    }

    pub fn brisk_rules(&self) -> BriskRules {
        let points_per_brisk = match self {
            Variant::Classic => 10,
            Variant::Turkish => 20,
        };
        BriskRules {
            points_per_brisk,
            max_brisks: MAX_BRISKS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BriskRules {
    pub points_per_brisk: i64,
    pub max_brisks: u32,
}

impl BriskRules {
    pub fn new(points_per_brisk: i64, max_brisks: u32) -> Self {
        BriskRules {
            points_per_brisk,
            max_brisks,
        }
    }

    fn check(&self, count: u32) -> Result<(), ScoreError> {
        if count > self.max_brisks {
            return Err(ScoreError::BriskOutOfRange {
                count,
                max: self.max_brisks,
            });
        }
        Ok(())
    }

    /// Points awarded for declaring `count` brisks
    pub fn points_for(&self, count: u32) -> Result<i64, ScoreError> {
        self.check(count)?;
        Ok(i64::from(count) * self.points_per_brisk)
    }

    /// Brisk count left to the opponent after a declaration of `count`
    pub fn complement(&self, count: u32) -> Result<u32, ScoreError> {
        self.check(count)?;
        Ok(self.max_brisks - count)
    }

    /// Points for a full deck, shared between both sides by every declaration
    pub fn deck_points(&self) -> i64 {
        i64::from(self.max_brisks) * self.points_per_brisk
    }
}
