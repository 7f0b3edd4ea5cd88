use super::DescriptorError;
use crate::digest::Digest;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const DEFAULT_TAG: &str = "latest";

/// Registry reference of a base image: `name[:tag][@digest]`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ImageRef {
    name: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Result<Self, DescriptorError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(DescriptorError::InvalidImage {
                reference: reference.to_string(),
                reason: "reference is empty".to_string(),
            });
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(DescriptorError::InvalidImage {
                reference: reference.to_string(),
                reason: "reference contains whitespace".to_string(),
            });
        }

        let (remainder, digest) = match reference.split_once('@') {
            Some((rest, digest)) => {
                let digest =
                    Digest::parse(digest).map_err(|e| DescriptorError::InvalidImage {
                        reference: reference.to_string(),
                        reason: e.to_string(),
                    })?;
                (rest, Some(digest))
            }
            None => (reference, None),
        };

        // A colon after the last slash separates the tag; earlier colons belong to a registry port.
        let last_slash = remainder.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match remainder[last_slash..].rfind(':') {
            Some(pos) => {
                let split = last_slash + pos;
                (&remainder[..split], Some(&remainder[split + 1..]))
            }
            None => (remainder, None),
        };

        if name.is_empty() || tag.is_some_and(str::is_empty) {
            return Err(DescriptorError::InvalidImage {
                reference: reference.to_string(),
                reason: "missing repository name or tag".to_string(),
            });
        }

        Ok(Self {
            name: name.to_string(),
            tag: tag.map(str::to_string),
            digest,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Tag used when resolving; an untagged reference means `latest`
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// Reference with the digest pinned, as recorded in built images
    pub fn pinned(&self, digest: Digest) -> Self {
        Self {
            digest: Some(digest),
            ..self.clone()
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

impl FromStr for ImageRef {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ImageRef {
    type Error = DescriptorError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ImageRef> for String {
    fn from(reference: ImageRef) -> Self {
        reference.to_string()
    }
}

impl JsonSchema for ImageRef {
    fn schema_name() -> String {
        "ImageRef".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}
