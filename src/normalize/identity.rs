//! Identity resolution for teams and drivers.
//!
//! Teams change display names across seasons and drivers reuse racing
//! numbers, so both are resolved through alias tables keyed by season.

use std::collections::HashMap;

use crate::config::TeamAliasConfig;

/// One lineage entry: an alias valid for an inclusive season range.
#[derive(Debug, Clone, PartialEq)]
struct LineageEntry {
    alias: String,
    team_id: i64,
    first_season: Option<i32>,
    last_season: Option<i32>,
}

impl LineageEntry {
    fn covers(&self, season: i32) -> bool {
        self.first_season.map_or(true, |first| season >= first)
            && self.last_season.map_or(true, |last| season <= last)
    }
}

/// Built-in team lineage: (alias, canonical team id)
const BUILTIN_LINEAGE: [(&str, i64); 14] = [
    ("Red Bull Racing", 1),
    ("Mercedes", 2),
    ("Ferrari", 3),
    ("McLaren", 4),
    ("Alpine", 5),
    ("Aston Martin", 6),
    ("Williams", 7),
    ("Haas F1 Team", 8),
    // AlphaTauri lineage
    ("AlphaTauri", 9),
    ("RB", 9),
    ("Racing Bulls", 9),
    // Sauber lineage
    ("Alfa Romeo", 10),
    ("Kick Sauber", 10),
    ("Sauber", 10),
];

/// Alias + season → canonical team id
#[derive(Debug, Clone)]
pub struct TeamLineage {
    entries: Vec<LineageEntry>,
}

impl Default for TeamLineage {
    fn default() -> Self {
        Self::with_extra(&[])
    }
}

impl TeamLineage {
    /// Built-in lineage with configured aliases taking precedence.
    pub fn with_extra(extra: &[TeamAliasConfig]) -> Self {
        let configured = extra.iter().map(|a| LineageEntry {
            alias: alias_key(&a.alias),
            team_id: a.team_id,
            first_season: a.first_season,
            last_season: a.last_season,
        });
        let builtin = BUILTIN_LINEAGE.iter().map(|(alias, team_id)| LineageEntry {
            alias: alias_key(alias),
            team_id: *team_id,
            first_season: None,
            last_season: None,
        });

        Self {
            entries: configured.chain(builtin).collect(),
        }
    }

    /// First entry matching the alias whose season range covers `season`.
    pub fn resolve(&self, alias: &str, season: i32) -> Option<i64> {
        let key = alias_key(alias);
        self.entries
            .iter()
            .find(|e| e.alias == key && e.covers(season))
            .map(|e| e.team_id)
    }
}

/// Case- and whitespace-insensitive alias key
fn alias_key(alias: &str) -> String {
    alias
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable driver id derived from the full name (`MAX_VERSTAPPEN`).
pub fn canonical_driver_id(full_name: &str) -> Option<String> {
    let parts: Vec<String> = full_name
        .split_whitespace()
        .map(|p| p.to_uppercase())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("_"))
    }
}

/// A racing number already bound to a different driver in that season.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AliasConflict {
    pub existing: String,
}

/// (driver number, season) → canonical driver id
#[derive(Debug, Clone, Default)]
pub struct DriverRegistry {
    aliases: HashMap<(i64, i32), String>,
}

impl DriverRegistry {
    pub fn new(existing: impl IntoIterator<Item = (i64, i32, String)>) -> Self {
        Self {
            aliases: existing
                .into_iter()
                .map(|(number, season, id)| ((number, season), id))
                .collect(),
        }
    }

    /// Bind a number to a driver for one season.
    ///
    /// Returns `Ok(true)` for a new binding, `Ok(false)` when it already
    /// existed, and a conflict when the number belongs to someone else.
    pub fn register(
        &mut self,
        number: i64,
        season: i32,
        driver_id: &str,
    ) -> Result<bool, AliasConflict> {
        match self.aliases.get(&(number, season)) {
            Some(existing) if existing == driver_id => Ok(false),
            Some(existing) => Err(AliasConflict {
                existing: existing.clone(),
            }),
            None => {
                self.aliases.insert((number, season), driver_id.to_string());
                Ok(true)
            }
        }
    }

    pub fn resolve(&self, number: i64, season: i32) -> Option<&str> {
        self.aliases.get(&(number, season)).map(String::as_str)
    }
}
