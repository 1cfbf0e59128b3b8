//! Workflow definition loader
//!
//! Load workflow definitions from YAML files and directories.

use std::path::Path;

use super::definition::WorkflowDefinition;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error in {file}: {error}")]
    Yaml {
        file: String,
        error: serde_yaml::Error,
    },
}

pub struct DefinitionLoader;

impl DefinitionLoader {
    /// Load every `.yaml`/`.yml` file in `dir`, sorted by file name
    pub fn load_directory(dir: &Path) -> Result<Vec<WorkflowDefinition>, LoadError> {
        let mut paths = Vec::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();

            if path.is_file() {
                let ext = path.extension().and_then(|e| e.to_str());
                let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

                // engine.yaml is the engine config, not a definition
                if filename == "engine.yaml" || filename == "engine.yml" {
                    continue;
                }

                if ext == Some("yaml") || ext == Some("yml") {
                    paths.push(path);
                }
            }
        }

        paths.sort();
        paths.iter().map(|p| Self::load_file(p)).collect()
    }

    pub fn load_file(path: &Path) -> Result<WorkflowDefinition, LoadError> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| LoadError::Yaml {
            file: path.display().to_string(),
            error: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_directory() {
        let dir = tempdir().unwrap();

        fs::write(
            dir.path().join("b_review.yaml"),
            r#"
workflowType: review_only
steps:
  - name: Review
    stepType: human_review
    handlerName: human_review
"#,
        )
        .unwrap();

        fs::write(
            dir.path().join("a_delivery.yml"),
            r#"
workflowType: delivery_only
steps:
  - name: Deliver
    stepType: delivery
    handler: delivery
  - name: Feedback
    stepType: feedback_collection
    handler: feedback
    dependsOn: [delivery]
"#,
        )
        .unwrap();

        fs::write(dir.path().join("engine.yaml"), "max_retries: 5").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let defs = DefinitionLoader::load_directory(dir.path()).unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].workflow_type, "delivery_only");
        assert_eq!(defs[0].steps[1].depends_on, vec!["delivery".to_string()]);
        assert_eq!(defs[1].workflow_type, "review_only");
    }

    #[test]
    fn test_load_file_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        fs::write(&path, "workflowType: [unterminated").unwrap();

        let err = DefinitionLoader::load_file(&path).unwrap_err();
        assert!(matches!(err, LoadError::Yaml { ref file, .. } if file.ends_with("broken.yaml")));
    }
}
