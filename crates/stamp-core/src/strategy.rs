//! Routing strategies and knowledge-base identities.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Which knowledge bases a query consults.
///
/// Every non-`General` strategy also consults the general KB as a safety
/// net; that composition lives in the multi-KB retriever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    General,
    VisaFree,
    Airline,
    AirlineVisaFree,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::General => "general",
            Strategy::VisaFree => "visa_free",
            Strategy::Airline => "airline",
            Strategy::AirlineVisaFree => "airline_visa_free",
        }
    }

    /// KBs consulted, in slot order; the general KB is always last.
    pub fn kbs(&self) -> &'static [Kb] {
        match self {
            Strategy::General => &[Kb::General],
            Strategy::VisaFree => &[Kb::VisaFree, Kb::General],
            Strategy::Airline => &[Kb::Airline, Kb::General],
            Strategy::AirlineVisaFree => &[Kb::Airline, Kb::VisaFree, Kb::General],
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "general" => Ok(Strategy::General),
            "visa_free" => Ok(Strategy::VisaFree),
            "airline" => Ok(Strategy::Airline),
            "airline_visa_free" => Ok(Strategy::AirlineVisaFree),
            _ => Err(()),
        }
    }
}

/// A named, independently indexed knowledge base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Kb {
    General,
    VisaFree,
    Airline,
    Rules,
    Hidden,
}

impl Kb {
    /// Vector-store collection backing this KB.
    pub fn collection(&self) -> &'static str {
        match self {
            Kb::General => "knowledge_base",
            Kb::VisaFree => "visa_free",
            Kb::Airline => "airline",
            Kb::Rules => "rules",
            Kb::Hidden => "hidden",
        }
    }
}

impl fmt::Display for Kb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.collection())
    }
}
