use std::path::Path;

use crate::error::Error;
use crate::models::config::Config;

/// Parses the strict YAML shape from a string. Any unknown field anywhere in the document is a
/// hard error.
pub fn load_from_str(raw: &str) -> Result<Config, Error> {
    serde_yaml::from_str(raw).map_err(Error::from)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config, Error> {
    let raw = std::fs::read_to_string(path)?;
    load_from_str(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config() {
        let yaml = r#"
contexts:
  - name: dev
    namespaces:
      - name: default
        forwards:
          - resource: pod/app
            port: 80
            local_port: 8080
"#;
        let cfg = load_from_str(yaml).unwrap();
        let forwards = cfg.forwards().unwrap();
        assert_eq!(forwards.len(), 1);
        assert_eq!(forwards[0].id(), "dev/default/pod/app:80");
    }

    #[test]
    fn rejects_unknown_top_level_field() {
        let yaml = r#"
contexts: []
bogus: true
"#;
        assert!(load_from_str(yaml).is_err());
    }

    #[test]
    fn rejects_duplicate_local_ports() {
        let yaml = r#"
contexts:
  - name: dev
    namespaces:
      - name: default
        forwards:
          - resource: pod/a
            port: 80
            local_port: 8080
          - resource: pod/b
            port: 81
            local_port: 8080
"#;
        let cfg = load_from_str(yaml).unwrap();
        assert!(cfg.forwards().is_err());
    }

    #[test]
    fn pod_selector_requires_non_empty_selector() {
        let yaml = r#"
contexts:
  - name: dev
    namespaces:
      - name: default
        forwards:
          - resource: pod
            port: 80
            local_port: 8080
"#;
        let cfg = load_from_str(yaml).unwrap();
        assert!(cfg.forwards().is_err());
    }

    #[test]
    fn parses_duration_units() {
        use crate::models::config::parse_duration;
        use std::time::Duration;

        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("20m").unwrap(), Duration::from_secs(20 * 60));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }
}
