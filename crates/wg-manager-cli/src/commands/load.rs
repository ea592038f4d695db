//! Loading configuration files.

use std::path::Path;

use tracing::debug;
use wg_manager::{InterfaceConfig, InterfaceDocument, parse_wg_config};

use crate::cli::ConfigArgs;
use crate::error::CliError;

/// Reads and validates the configuration `args` points at.
///
/// # Errors
///
/// Returns an error if the file cannot be read, does not parse, or is
/// invalid.
pub async fn load_config(args: &ConfigArgs) -> Result<InterfaceConfig, CliError> {
    let text = tokio::fs::read_to_string(&args.path)
        .await
        .map_err(|e| CliError::Config(format!("{}: {e}", args.path.display())))?;
    parse_config(&args.path, &text, args.name.as_deref())
}

/// Parses configuration text, choosing the format by file extension.
///
/// # Errors
///
/// Returns an error if the text does not parse or is invalid.
pub fn parse_config(
    path: &Path,
    text: &str,
    name: Option<&str>,
) -> Result<InterfaceConfig, CliError> {
    let is_conf = path.extension().is_some_and(|ext| ext == "conf");
    debug!(path = %path.display(), format = if is_conf { "wg-quick" } else { "json" }, "loading configuration");

    if is_conf {
        let name = name
            .or_else(|| path.file_stem().and_then(|s| s.to_str()))
            .ok_or_else(|| {
                CliError::Config(format!("cannot derive interface name from {}", path.display()))
            })?;
        return Ok(parse_wg_config(name, text)?);
    }

    let mut document = InterfaceDocument::from_json(text)?;
    if let Some(name) = name {
        document.name = name.to_string();
    }
    Ok(InterfaceConfig::try_from(document)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRIVATE: &str = "GEd85EVCEFq5NfKEeTbRUHRutLF0+1WNEP4WG8Aq1kc=";

    #[test]
    fn conf_name_comes_from_file_stem() {
        let text = format!("[Interface]\nPrivateKey = {PRIVATE}\n");
        let config = parse_config(Path::new("/etc/wireguard/wg3.conf"), &text, None).expect("valid");
        assert_eq!(config.name, "wg3");

        let config = parse_config(Path::new("office.conf"), &text, Some("wg9")).expect("valid");
        assert_eq!(config.name, "wg9");
    }

    #[test]
    fn json_name_override() {
        let text = r#"{"name": "wg0", "listen_port": 51820}"#;
        let config = parse_config(Path::new("wg0.json"), text, Some("wg5")).expect("valid");
        assert_eq!(config.name, "wg5");
        assert_eq!(config.listen_port, Some(51820));
    }

    #[test]
    fn invalid_json_document() {
        let text = r#"{"name": "wg0", "mtu": 9000}"#;
        let err = parse_config(Path::new("wg0.json"), text, None).expect_err("mtu");
        assert!(matches!(err, CliError::Invalid(ref e) if e.field == "mtu"));
    }

    #[tokio::test]
    async fn missing_file_is_config_error() {
        let args = ConfigArgs {
            path: "/nonexistent/wg0.json".into(),
            name: None,
        };
        assert!(matches!(load_config(&args).await, Err(CliError::Config(_))));
    }
}
