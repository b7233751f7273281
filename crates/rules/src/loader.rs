use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::BlockingRule;

#[derive(Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<BlockingRule>,
}

/// Read a YAML rules file of the form `rules: [ ... ]`.
///
/// Structural errors fail the whole file; rules that parse but do not
/// compile are dropped later by [`crate::RuleSet::compile`].
pub fn load_rules_file(path: &Path) -> anyhow::Result<Vec<BlockingRule>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read rules file {}: {}", path.display(), e))?;
    let file: RulesFile = serde_yaml::from_str(&content)
        .map_err(|e| anyhow::anyhow!("failed to parse rules file {}: {}", path.display(), e))?;
    info!(path = %path.display(), count = file.rules.len(), "loaded rules file");
    Ok(file.rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Condition, Field, Operator, RuleAction, RuleType};
    use std::io::Write as _;

    struct TempFile {
        path: std::path::PathBuf,
    }

    impl TempFile {
        fn new(contents: &str) -> Self {
            let id = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos();
            let path = std::env::temp_dir()
                .join(format!("blockgate_rules_test_{}_{}.yaml", id, std::process::id()));
            let mut f = std::fs::File::create(&path).unwrap();
            f.write_all(contents.as_bytes()).unwrap();
            Self { path }
        }
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[test]
    fn parses_yaml_rules() {
        let file = TempFile::new(
            r#"
rules:
  - id: block-scanners
    name: Block known scanners
    type: signature
    priority: 100
    action: block
    conditions:
      type: match
      field: "header:User-Agent"
      op: matches
      value: "(?i)(sqlmap|nikto|nmap)"
  - id: partner-range
    name: Allow partner network
    type: ip
    priority: 200
    action: allow
    conditions:
      type: all
      conditions:
        - type: match
          field: source_ip
          op: in_cidr
          value: ["192.0.2.0/24"]
        - type: match
          field: api_key
          op: exists
  - id: big-bodies
    name: Flag large uploads
    action: flag
    enabled: false
    conditions:
      type: match
      field: body_size
      op: gt
      value: 1048576
"#,
        );
        let rules = load_rules_file(&file.path).unwrap();
        assert_eq!(rules.len(), 3);

        assert_eq!(rules[0].rule_type, RuleType::Signature);
        assert_eq!(rules[0].action, RuleAction::Block);
        let Condition::Match(ref predicate) = rules[0].conditions else {
            panic!("expected a match leaf");
        };
        assert_eq!(predicate.field, Field::Header("User-Agent".into()));
        assert_eq!(predicate.op, Operator::Matches);

        assert!(matches!(rules[1].conditions, Condition::All { .. }));

        assert_eq!(rules[2].rule_type, RuleType::Custom);
        assert!(!rules[2].enabled);
        assert_eq!(rules[2].priority, 0);
    }

    #[test]
    fn unknown_field_fails_the_file() {
        let file = TempFile::new(
            "rules:\n  - id: x\n    name: x\n    action: block\n    conditions:\n      type: match\n      field: cookie\n      op: exists\n",
        );
        assert!(load_rules_file(&file.path).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_rules_file(Path::new("/nonexistent/rules.yaml")).is_err());
    }
}
