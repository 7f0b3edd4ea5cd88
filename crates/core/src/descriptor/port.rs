use super::DescriptorError;
use schemars::gen::SchemaGenerator;
use schemars::schema::Schema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// Advisory port declaration. Nothing in the build or launch path binds it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "PortRepr", into = "String")]
pub struct ExposedPort {
    pub port: u16,
    pub protocol: Protocol,
}

impl ExposedPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Protocol::Tcp,
        }
    }
}

impl fmt::Display for ExposedPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol.as_str())
    }
}

impl FromStr for ExposedPort {
    type Err = DescriptorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| DescriptorError::InvalidPort {
            value: s.to_string(),
            reason: reason.to_string(),
        };

        let (number, protocol) = match s.trim().split_once('/') {
            Some((number, proto)) => {
                let protocol = match proto.to_ascii_lowercase().as_str() {
                    "tcp" => Protocol::Tcp,
                    "udp" => Protocol::Udp,
                    _ => return Err(invalid("protocol must be tcp or udp")),
                };
                (number, protocol)
            }
            None => (s.trim(), Protocol::Tcp),
        };

        let port = number
            .parse::<u16>()
            .map_err(|_| invalid("not a port number"))?;
        if port == 0 {
            return Err(invalid("port 0 cannot be exposed"));
        }

        Ok(Self { port, protocol })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortRepr {
    Number(u16),
    Text(String),
}

impl TryFrom<PortRepr> for ExposedPort {
    type Error = DescriptorError;

    fn try_from(value: PortRepr) -> Result<Self, Self::Error> {
        match value {
            PortRepr::Number(0) => Err(DescriptorError::InvalidPort {
                value: "0".to_string(),
                reason: "port 0 cannot be exposed".to_string(),
            }),
            PortRepr::Number(port) => Ok(Self::tcp(port)),
            PortRepr::Text(text) => text.parse(),
        }
    }
}

impl From<ExposedPort> for String {
    fn from(port: ExposedPort) -> Self {
        port.to_string()
    }
}

impl JsonSchema for ExposedPort {
    fn schema_name() -> String {
        "ExposedPort".to_string()
    }

    fn json_schema(gen: &mut SchemaGenerator) -> Schema {
        String::json_schema(gen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        bare = { "5000", 5000, Protocol::Tcp },
        tcp = { "8080/tcp", 8080, Protocol::Tcp },
        udp = { "53/udp", 53, Protocol::Udp },
        upper = { "53/UDP", 53, Protocol::Udp },
    )]
    fn test_parse(input: &str, port: u16, protocol: Protocol) {
        let parsed: ExposedPort = input.parse().unwrap();
        assert_eq!(parsed.port, port);
        assert_eq!(parsed.protocol, protocol);
    }

    #[parameterized(
        zero = { "0" },
        too_large = { "70000" },
        sctp = { "80/sctp" },
        word = { "http" },
    )]
    fn test_parse_rejects(input: &str) {
        assert!(input.parse::<ExposedPort>().is_err());
    }

    #[test]
    fn test_deserialize_number_or_string() {
        let ports: Vec<ExposedPort> = serde_yaml::from_str("[5000, \"53/udp\"]").unwrap();
        assert_eq!(ports, vec![ExposedPort::tcp(5000), "53/udp".parse().unwrap()]);
    }

    #[test]
    fn test_serialize_with_protocol() {
        let json = serde_json::to_string(&ExposedPort::tcp(5000)).unwrap();
        assert_eq!(json, "\"5000/tcp\"");
    }
}
