//! KDL document parsing.

use anyhow::{anyhow, Result};
use tracing::trace;

use crate::Config;

mod controller;

/// Build a [`Config`] from a parsed document.
pub(crate) fn parse_document(document: &::kdl::KdlDocument) -> Result<Config> {
    let mut config = Config::default();

    for node in document.nodes() {
        let name = node.name().value();
        trace!(block = name, "Parsing configuration block");

        match name {
            "controller" => config.controller = controller::parse_controller(node)?,
            "backoff" => config.backoff = controller::parse_backoff(node)?,
            "acme" => config.acme = controller::parse_acme(node)?,
            "renewal" => config.renewal = controller::parse_renewal(node)?,
            "solvers" => config.solvers = controller::parse_solvers(node)?,
            other => {
                return Err(anyhow!(
                    "Unknown configuration block '{}'. Expected one of: controller, backoff, acme, renewal, solvers",
                    other
                ))
            }
        }
    }

    Ok(config)
}

// ============================================================================
// Helpers
// ============================================================================

fn child<'a>(node: &'a ::kdl::KdlNode, name: &str) -> Option<&'a ::kdl::KdlNode> {
    node.children()?.get(name)
}

fn first_arg<'a>(node: &'a ::kdl::KdlNode) -> Option<&'a ::kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|entry| entry.name().is_none())
        .map(|entry| entry.value())
}

/// First argument of child node `name` as a string.
pub(crate) fn get_string_entry(node: &::kdl::KdlNode, name: &str) -> Option<String> {
    child(node, name)
        .and_then(first_arg)
        .and_then(|v| v.as_string())
        .map(str::to_string)
}

/// First argument of child node `name` as a non-negative integer.
pub(crate) fn get_u64_entry(node: &::kdl::KdlNode, name: &str) -> Result<Option<u64>> {
    let Some(value) = child(node, name).and_then(first_arg) else {
        return Ok(None);
    };
    let int = value
        .as_integer()
        .ok_or_else(|| anyhow!("'{}' must be an integer, got {}", name, value))?;
    u64::try_from(int)
        .map(Some)
        .map_err(|_| anyhow!("'{}' must not be negative, got {}", name, int))
}

/// All string arguments of child node `name`.
pub(crate) fn get_string_args(node: &::kdl::KdlNode, name: &str) -> Vec<String> {
    child(node, name)
        .map(|n| {
            n.entries()
                .iter()
                .filter(|entry| entry.name().is_none())
                .filter_map(|entry| entry.value().as_string().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(text: &str) -> ::kdl::KdlNode {
        let doc: ::kdl::KdlDocument = text.parse().unwrap();
        doc.nodes()[0].clone()
    }

    #[test]
    fn test_helpers() {
        let block = node(r#"acme { http01-port 8080; nameservers "a:53" "b:53"; label "x" }"#);
        assert_eq!(get_u64_entry(&block, "http01-port").unwrap(), Some(8080));
        assert_eq!(get_u64_entry(&block, "missing").unwrap(), None);
        assert_eq!(get_string_args(&block, "nameservers"), vec!["a:53", "b:53"]);
        assert_eq!(get_string_entry(&block, "label").as_deref(), Some("x"));
        assert!(get_u64_entry(&block, "label").is_err());
    }

    #[test]
    fn test_negative_integer_rejected() {
        let block = node("controller { workers -1 }");
        assert!(get_u64_entry(&block, "workers").is_err());
    }

    #[test]
    fn test_unknown_block_rejected() {
        let doc: ::kdl::KdlDocument = "listeners { }".parse().unwrap();
        let err = parse_document(&doc).unwrap_err();
        assert!(err.to_string().contains("Unknown configuration block"));
    }
}
