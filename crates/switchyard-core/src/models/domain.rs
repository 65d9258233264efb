use std::fmt;

use serde::{Deserialize, Serialize};

/// A pipeline stage owned by exactly one domain master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Nlp,
    Query,
    Response,
}

impl Domain {
    /// Fixed pipeline order.
    pub const PIPELINE: [Domain; 3] = [Domain::Nlp, Domain::Query, Domain::Response];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nlp => "nlp",
            Self::Query => "query",
            Self::Response => "response",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "nlp" => Some(Self::Nlp),
            "query" => Some(Self::Query),
            "response" => Some(Self::Response),
            _ => None,
        }
    }

    /// The successor in the pipeline, or `None` for the terminal domain.
    pub fn next(&self) -> Option<Domain> {
        match self {
            Self::Nlp => Some(Self::Query),
            Self::Query => Some(Self::Response),
            Self::Response => None,
        }
    }

    /// Slave types whose pools belong to this domain.
    pub fn slave_types(&self) -> &'static [SlaveType] {
        match self {
            Self::Nlp => &[SlaveType::QueryRefinement, SlaveType::EntityRecognition],
            Self::Query => &[
                SlaveType::OntologyMapping,
                SlaveType::SparqlConstruction,
                SlaveType::Validation,
            ],
            Self::Response => &[SlaveType::ResponseGeneration],
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of worker. The set is closed; each type belongs to one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlaveType {
    QueryRefinement,
    EntityRecognition,
    OntologyMapping,
    SparqlConstruction,
    Validation,
    ResponseGeneration,
}

impl SlaveType {
    pub const ALL: [SlaveType; 6] = [
        SlaveType::QueryRefinement,
        SlaveType::EntityRecognition,
        SlaveType::OntologyMapping,
        SlaveType::SparqlConstruction,
        SlaveType::Validation,
        SlaveType::ResponseGeneration,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueryRefinement => "query_refinement",
            Self::EntityRecognition => "entity_recognition",
            Self::OntologyMapping => "ontology_mapping",
            Self::SparqlConstruction => "sparql_construction",
            Self::Validation => "validation",
            Self::ResponseGeneration => "response_generation",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "query_refinement" => Some(Self::QueryRefinement),
            "entity_recognition" => Some(Self::EntityRecognition),
            "ontology_mapping" => Some(Self::OntologyMapping),
            "sparql_construction" => Some(Self::SparqlConstruction),
            "validation" => Some(Self::Validation),
            "response_generation" => Some(Self::ResponseGeneration),
            _ => None,
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Self::QueryRefinement | Self::EntityRecognition => Domain::Nlp,
            Self::OntologyMapping | Self::SparqlConstruction | Self::Validation => Domain::Query,
            Self::ResponseGeneration => Domain::Response,
        }
    }
}

impl fmt::Display for SlaveType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_order() {
        assert_eq!(Domain::Nlp.next(), Some(Domain::Query));
        assert_eq!(Domain::Query.next(), Some(Domain::Response));
        assert_eq!(Domain::Response.next(), None);
    }

    #[test]
    fn test_slave_types_belong_to_their_domain() {
        for domain in Domain::PIPELINE {
            for slave_type in domain.slave_types() {
                assert_eq!(slave_type.domain(), domain);
            }
        }
        let total: usize = Domain::PIPELINE.iter().map(|d| d.slave_types().len()).sum();
        assert_eq!(total, SlaveType::ALL.len());
    }

    #[test]
    fn test_slave_type_wire_names() {
        for slave_type in SlaveType::ALL {
            let json = serde_json::to_string(&slave_type).unwrap();
            assert_eq!(json, format!("\"{}\"", slave_type.as_str()));
            assert_eq!(SlaveType::from_str(slave_type.as_str()), Some(slave_type));
        }
        assert!(serde_json::from_str::<SlaveType>("\"summarization\"").is_err());
    }
}
