//! Extraction of structured values from provisioning tool output.

use super::ProvisioningCommand;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

static CREATED: OnceLock<Option<Regex>> = OnceLock::new();
static DESTROYED: OnceLock<Option<Regex>> = OnceLock::new();
static INSTANCE_ID: OnceLock<Option<Regex>> = OnceLock::new();
static PUBLIC_IP: OnceLock<Option<Regex>> = OnceLock::new();
static PRIVATE_IP: OnceLock<Option<Regex>> = OnceLock::new();
static OUTPUT_LINE: OnceLock<Option<Regex>> = OnceLock::new();

fn pattern(cell: &'static OnceLock<Option<Regex>>, source: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(source).ok()).as_ref()
}

/// Addresses reported for a provisioned machine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddresses {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
}

impl IpAddresses {
    pub fn is_empty(&self) -> bool {
        self.public_ip.is_none() && self.private_ip.is_none()
    }
}

/// Values recognised in the tool's standard output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedOutput {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub created_resources: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destroyed_resources: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output_values: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<IpAddresses>,
}

/// Parse `stdout` according to what `command` is expected to print
///
/// `apply` and `output` report created resources, declared outputs, the
/// instance identifier and IP addresses. `destroy` reports destroyed
/// resources. Other commands yield nothing.
pub fn parse_output(command: &ProvisioningCommand, stdout: &str) -> ParsedOutput {
    match command {
        ProvisioningCommand::Apply | ProvisioningCommand::Output => {
            let ip_address = IpAddresses {
                public_ip: first_capture(
                    pattern(&PUBLIC_IP, r#"public_ip\s*=\s*"?(\d{1,3}(?:\.\d{1,3}){3})"?"#),
                    stdout,
                ),
                private_ip: first_capture(
                    pattern(&PRIVATE_IP, r#"private_ip\s*=\s*"?(\d{1,3}(?:\.\d{1,3}){3})"?"#),
                    stdout,
                ),
            };

            ParsedOutput {
                created_resources: all_captures(
                    pattern(&CREATED, r"([\w.\-\[\]]+):\s+Creation complete"),
                    stdout,
                ),
                output_values: output_values(stdout),
                instance_id: first_capture(
                    pattern(&INSTANCE_ID, r#"instance_id\s*=\s*"?([\w-]+)"?"#),
                    stdout,
                ),
                ip_address: (!ip_address.is_empty()).then_some(ip_address),
                ..ParsedOutput::default()
            }
        }
        ProvisioningCommand::Destroy => ParsedOutput {
            destroyed_resources: all_captures(
                pattern(&DESTROYED, r"([\w.\-\[\]]+):\s+Destruction complete"),
                stdout,
            ),
            ..ParsedOutput::default()
        },
        _ => ParsedOutput::default(),
    }
}

/// `key = value` pairs following the `Outputs:` header, up to the first blank line
///
/// Surrounding double quotes are removed from values.
pub fn output_values(stdout: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    let Some(line_pattern) = pattern(&OUTPUT_LINE, r"^\s*([A-Za-z_][\w-]*)\s*=\s*(.*?)\s*$") else {
        return values;
    };

    let mut lines = stdout.lines().skip_while(|line| line.trim() != "Outputs:");
    if lines.next().is_none() {
        return values;
    }

    for line in lines.skip_while(|line| line.trim().is_empty()) {
        if line.trim().is_empty() {
            break;
        }
        if let Some(captures) = line_pattern.captures(line) {
            let value = captures[2].trim_matches('"').to_string();
            values.insert(captures[1].to_string(), value);
        }
    }
    values
}

fn first_capture(pattern: Option<&Regex>, text: &str) -> Option<String> {
    pattern?
        .captures(text)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

fn all_captures(pattern: Option<&Regex>, text: &str) -> Vec<String> {
    match pattern {
        Some(pattern) => pattern
            .captures_iter(text)
            .filter_map(|captures| captures.get(1))
            .map(|m| m.as_str().to_string())
            .collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
#[path = "output_tests.rs"]
mod tests;
