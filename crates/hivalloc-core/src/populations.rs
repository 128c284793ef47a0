//! Population definitions and the ordered population set.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Locus, Result};

/// A single population group with its behavioral flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Population {
    pub short: String,
    pub full: String,
    pub male: bool,
    pub female: bool,
    pub injects: bool,
    pub sexworker: bool,
    pub client: bool,
}

impl Population {
    pub fn new(short: impl Into<String>, full: impl Into<String>) -> Self {
        Population {
            short: short.into(),
            full: full.into(),
            male: false,
            female: false,
            injects: false,
            sexworker: false,
            client: false,
        }
    }

    pub fn male(mut self) -> Self {
        self.male = true;
        self
    }

    pub fn female(mut self) -> Self {
        self.female = true;
        self
    }

    pub fn injects(mut self) -> Self {
        self.injects = true;
        self
    }

    pub fn sexworker(mut self) -> Self {
        self.sexworker = true;
        self
    }

    pub fn client(mut self) -> Self {
        self.client = true;
        self
    }
}

/// Ordered sequence of populations. The order is stable and defines the
/// population axis of every per-population array in the model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationSet {
    pops: Vec<Population>,
}

impl PopulationSet {
    pub fn new(pops: Vec<Population>) -> Result<Self> {
        for (i, a) in pops.iter().enumerate() {
            for b in pops.iter().skip(i + 1) {
                if a.short == b.short {
                    return Err(Error::Infeasible {
                        reason: format!("duplicate population short name '{}'", a.short),
                        locus: Locus::population(a.short.clone()),
                    });
                }
            }
        }
        Ok(PopulationSet { pops })
    }

    pub fn len(&self) -> usize {
        self.pops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Population> {
        self.pops.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Population> {
        self.pops.get(index)
    }

    pub fn index_of(&self, short: &str) -> Option<usize> {
        self.pops.iter().position(|p| p.short == short)
    }

    pub fn short_names(&self) -> Vec<&str> {
        self.pops.iter().map(|p| p.short.as_str()).collect()
    }

    pub fn male_flags(&self) -> Vec<bool> {
        self.pops.iter().map(|p| p.male).collect()
    }

    pub fn female_flags(&self) -> Vec<bool> {
        self.pops.iter().map(|p| p.female).collect()
    }

    pub fn injector_flags(&self) -> Vec<bool> {
        self.pops.iter().map(|p| p.injects).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_names_rejected() {
        let result = PopulationSet::new(vec![
            Population::new("FSW", "Female sex workers").female().sexworker(),
            Population::new("FSW", "Also FSW").female(),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_lookup() {
        let set = PopulationSet::new(vec![
            Population::new("FSW", "Female sex workers").female().sexworker(),
            Population::new("MSM", "Men who have sex with men").male(),
        ])
        .unwrap();
        assert_eq!(set.index_of("MSM"), Some(1));
        assert_eq!(set.index_of("PWID"), None);
        assert_eq!(set.male_flags(), vec![false, true]);
    }
}
