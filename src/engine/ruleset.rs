// Ruleset: the configuration data that selects a rule variant, plus the league presets.

use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::config::*;
use crate::error::RulesetError;

/// Parameters governing one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ruleset {
    pub width: usize,
    pub height: usize,
    pub pacs_per_side: usize,
    pub num_cherries: usize,
    pub cherry_score: u32,
    pub max_turns: u32,
    pub speed_ability_enabled: bool,
    pub switch_ability_enabled: bool,
    /// When false every pac is Neutral and combat never happens.
    pub typed_pacs: bool,
    /// Accepted in the data model but rejected by [`Ruleset::validate`].
    pub fog_of_war: bool,
    pub turn_deadline_ms: u64,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids: u32,
}

impl Default for Ruleset {
    fn default() -> Self {
        Ruleset {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            pacs_per_side: DEFAULT_PACS_PER_SIDE,
            num_cherries: DEFAULT_NUM_CHERRIES,
            cherry_score: DEFAULT_CHERRY_SCORE,
            max_turns: DEFAULT_MAX_TURNS,
            speed_ability_enabled: true,
            switch_ability_enabled: true,
            typed_pacs: true,
            fog_of_war: false,
            turn_deadline_ms: DEFAULT_TURN_DEADLINE_MS,
            memory_mb: DEFAULT_MEMORY_MB,
            cpus: DEFAULT_CPUS,
            pids: DEFAULT_PIDS,
        }
    }
}

impl Ruleset {
    /// Check that the ruleset describes a playable match.
    pub fn validate(&self) -> Result<(), RulesetError> {
        if self.fog_of_war {
            return Err(RulesetError::FogOfWarUnsupported);
        }
        if self.pacs_per_side == 0 {
            return Err(RulesetError::NoPacs);
        }
        if !(MIN_WIDTH..=MAX_WIDTH).contains(&self.width)
            || !(MIN_HEIGHT..=MAX_HEIGHT).contains(&self.height)
        {
            return Err(RulesetError::Dimensions {
                width: self.width,
                height: self.height,
            });
        }
        Ok(())
    }

    /// The preset for a league. The pac count is drawn from the league's range using `seed`.
    pub fn for_league(league: League, seed: u64) -> Self {
        let (min_pacs, max_pacs) = league.pacs_range();
        let mut rng = StdRng::seed_from_u64(seed);
        let abilities = league >= League::Silver;
        Ruleset {
            pacs_per_side: rng.gen_range(min_pacs..=max_pacs),
            num_cherries: league.num_cherries(),
            speed_ability_enabled: abilities,
            switch_ability_enabled: abilities,
            typed_pacs: abilities,
            ..Ruleset::default()
        }
    }
}

/// Progressive rule tiers. Later leagues unlock more of the rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum League {
    Wood2,
    Wood1,
    Bronze,
    Silver,
    Gold,
}

impl League {
    pub fn pacs_range(self) -> (usize, usize) {
        match self {
            League::Wood2 => (1, 1),
            League::Wood1 | League::Bronze => (2, 3),
            League::Silver => (3, 4),
            League::Gold => (3, 5),
        }
    }

    pub fn num_cherries(self) -> usize {
        match self {
            League::Wood2 => 2,
            League::Wood1 | League::Bronze => 4,
            League::Silver => 6,
            League::Gold => 8,
        }
    }
}

impl FromStr for League {
    type Err = RulesetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(' ', "").as_str() {
            "wood2" | "wood" => Ok(League::Wood2),
            "wood1" => Ok(League::Wood1),
            "bronze" => Ok(League::Bronze),
            "silver" => Ok(League::Silver),
            "gold" => Ok(League::Gold),
            _ => Err(RulesetError::UnknownLeague(s.to_string())),
        }
    }
}

impl std::fmt::Display for League {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            League::Wood2 => "Wood2",
            League::Wood1 => "Wood1",
            League::Bronze => "Bronze",
            League::Silver => "Silver",
            League::Gold => "Gold",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let r = Ruleset::default();
        assert!(r.validate().is_ok());
        assert_eq!(r.cherry_score, 10);
        assert_eq!(r.max_turns, 200);
    }

    #[test]
    fn test_fog_is_rejected() {
        let r = Ruleset {
            fog_of_war: true,
            ..Ruleset::default()
        };
        assert_eq!(r.validate(), Err(RulesetError::FogOfWarUnsupported));
    }

    #[test]
    fn test_invalid_sizes() {
        let r = Ruleset {
            pacs_per_side: 0,
            ..Ruleset::default()
        };
        assert_eq!(r.validate(), Err(RulesetError::NoPacs));
        let r = Ruleset {
            width: 2,
            ..Ruleset::default()
        };
        assert!(matches!(r.validate(), Err(RulesetError::Dimensions { .. })));
    }

    #[test]
    fn test_league_presets() {
        let wood = Ruleset::for_league(League::Wood2, 7);
        assert_eq!(wood.pacs_per_side, 1);
        assert!(!wood.speed_ability_enabled);
        assert!(!wood.typed_pacs);
        assert!(!wood.fog_of_war);

        for seed in 0..10 {
            let gold = Ruleset::for_league(League::Gold, seed);
            assert!((3..=5).contains(&gold.pacs_per_side));
            assert_eq!(gold.num_cherries, 8);
            assert!(gold.switch_ability_enabled);
            assert!(gold.validate().is_ok());
        }
        assert_eq!(
            Ruleset::for_league(League::Silver, 3),
            Ruleset::for_league(League::Silver, 3)
        );
    }

    #[test]
    fn test_league_names() {
        assert_eq!("Wood 1".parse::<League>().unwrap(), League::Wood1);
        assert_eq!("GOLD".parse::<League>().unwrap(), League::Gold);
        assert!("platinum".parse::<League>().is_err());
        assert_eq!(League::Bronze.to_string(), "Bronze");
    }

    #[test]
    fn test_ruleset_from_partial_json() {
        let r: Ruleset = serde_json::from_str(r#"{"pacs_per_side": 2, "num_cherries": 0}"#).unwrap();
        assert_eq!(r.pacs_per_side, 2);
        assert_eq!(r.num_cherries, 0);
        assert_eq!(r.width, DEFAULT_WIDTH);
    }
}
