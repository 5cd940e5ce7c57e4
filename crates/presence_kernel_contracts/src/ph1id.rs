#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::{validate_id, validate_text};
use crate::{ContractViolation, SchemaVersion, Validate};

pub const PH1ID_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for SubjectId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("subject_id", &self.0, 64)
    }
}

impl TryFrom<String> for SubjectId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SubjectId> for String {
    fn from(v: SubjectId) -> Self {
        v.0
    }
}

/// Badge / RFID tag identifier as presented by a scanning terminal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagId(String);

impl TagId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(id.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for TagId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_id("tag_id", &self.0, 128)
    }
}

impl TryFrom<String> for TagId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TagId> for String {
    fn from(v: TagId) -> Self {
        v.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectRecord {
    pub schema_version: SchemaVersion,
    pub subject_id: SubjectId,
    pub display_name: String,
    pub tag_ids: Vec<TagId>,
    pub active: bool,
}

impl SubjectRecord {
    pub fn v1(
        subject_id: SubjectId,
        display_name: impl Into<String>,
        tag_ids: Vec<TagId>,
        active: bool,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: PH1ID_CONTRACT_VERSION,
            subject_id,
            display_name: display_name.into(),
            tag_ids,
            active,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for SubjectRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.subject_id.validate()?;
        validate_text("subject_record.display_name", &self.display_name, 128)?;
        if self.tag_ids.len() > 16 {
            return Err(ContractViolation::InvalidValue {
                field: "subject_record.tag_ids",
                reason: "must be <= 16 entries",
            });
        }
        for tag in &self.tag_ids {
            tag.validate()?;
        }
        Ok(())
    }
}

/// Outcome of an identity lookup. `NotFound` is an expected result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityResolution {
    Resolved(SubjectRecord),
    NotFound,
}

/// Receipt-facing summary of a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectSummary {
    pub subject_id: SubjectId,
    pub display_name: String,
}

impl From<&SubjectRecord> for SubjectSummary {
    fn from(r: &SubjectRecord) -> Self {
        Self {
            subject_id: r.subject_id.clone(),
            display_name: r.display_name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_id_01_subject_id_deserialize_validates() {
        let ok: SubjectId = serde_json::from_str("\"member_17\"").unwrap();
        assert_eq!(ok.as_str(), "member_17");
        assert!(serde_json::from_str::<SubjectId>("\"\"").is_err());
    }

    #[test]
    fn at_id_02_subject_record_rejects_blank_name() {
        let out = SubjectRecord::v1(SubjectId::new("s1").unwrap(), "  ", vec![], true);
        assert!(matches!(
            out,
            Err(ContractViolation::InvalidValue {
                field: "subject_record.display_name",
                ..
            })
        ));
    }
}
