//! The registry of known program types.
//!
//! A semicolon-delimited table: short name, display name, full name, a
//! saturating flag, and up to three (input key, population) targets. The
//! trailing overhead programs carry no targets but still absorb budget.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Locus, Result};
use crate::params::InputKey;

/// One catalog line: `SHORT;Name;Full name;saturating;par1;pop1;par2;pop2;par3;pop3`.
pub const PROGRAM_CATALOG: &str = "\
COND;Condoms;Condom promotion and distribution;1;condom.reg;All;condom.cas;All;;\n\
SBCC;SBCC;Social and behavior change communication;1;condom.reg;All;condom.cas;All;;\n\
STI;STI;Diagnosis and treatment of sexually transmitted infections;1;stiprevulc;All;;;;\n\
VMMC;VMMC;Voluntary medical male circumcision;0;numcircum;All;;;;\n\
FSWP;FSW programs;Programs for female sex workers and clients;1;condom.com;FSW;hivtest;FSW;;\n\
MSMP;MSM programs;Programs for men who have sex with men;1;condom.reg;MSM;condom.cas;MSM;;\n\
PWIDP;PWID programs;Programs for people who inject drugs;1;hivtest;PWID;condom.reg;PWID;condom.cas;PWID\n\
OST;OST;Opiate substitution therapy;0;numost;All;;;;\n\
NSP;NSP;Needle-syringe program;1;sharing;All;;;;\n\
PREP;PrEP;Pre-exposure prophylaxis;1;prep;All;;;;\n\
PEP;PEP;Post-exposure prophylaxis;1;pep;All;;;;\n\
CT;Cash transfers;Cash transfers for HIV risk reduction;1;numacts.reg;All;numacts.cas;All;;\n\
HTC;HTC;HIV testing and counseling;1;hivtest;All;;;;\n\
ART;ART;Antiretroviral therapy;0;numfirstline;All;numsecondline;All;;\n\
PMTCT;PMTCT;Prevention of mother-to-child transmission;0;numpmtct;All;;;;\n\
CARE;Other care;Other care;0;;;;;;\n\
OVC;OVC;Orphans and vulnerable children;0;;;;;;\n\
MGMT;MGMT;Management;0;;;;;;\n\
HR;HR;HR and training;0;;;;;;\n\
ENV;ENV;Enabling environment;0;;;;;;\n\
SP;SP;Social protection;0;;;;;;\n\
MESR;M&E;Monitoring, evaluation, surveillance, and research;0;;;;;;\n\
INFR;INFR;Health infrastructure;0;;;;;;";

/// A parsed catalog entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub short: String,
    pub name: String,
    pub full: String,
    pub saturating: bool,
    /// (target input key, target population short name or "All").
    pub targets: Vec<(InputKey, String)>,
}

impl CatalogEntry {
    /// Whether this is a non-targeted overhead program.
    pub fn is_overhead(&self) -> bool {
        self.targets.is_empty()
    }
}

/// Parse the built-in catalog (or a caller-supplied one in the same format).
pub fn parse_catalog(source: &str) -> Result<Vec<CatalogEntry>> {
    let mut entries = Vec::new();
    for line in source.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split(';').collect();
        if fields.len() != 10 {
            return Err(Error::ShapeMismatch {
                expected: "10 fields".into(),
                actual: format!("{} fields", fields.len()),
                locus: Locus::program(fields.first().copied().unwrap_or("?")),
            });
        }
        let mut targets = Vec::new();
        for pair in 0..3 {
            let par = fields[4 + 2 * pair];
            let pop = fields[5 + 2 * pair];
            if !par.is_empty() {
                targets.push((par.parse::<InputKey>()?, pop.to_string()));
            }
        }
        entries.push(CatalogEntry {
            short: fields[0].to_string(),
            name: fields[1].to_string(),
            full: fields[2].to_string(),
            saturating: fields[3] == "1",
            targets,
        });
    }
    Ok(entries)
}

/// Programs in the built-in catalog targeting the given input key.
pub fn programs_for_key(key: &InputKey) -> Vec<String> {
    parse_catalog(PROGRAM_CATALOG)
        .map(|entries| {
            entries
                .into_iter()
                .filter(|e| e.targets.iter().any(|(k, _)| k == key))
                .map(|e| e.short)
                .collect()
        })
        .unwrap_or_default()
}
