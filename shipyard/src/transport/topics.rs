//! Live log channel definitions

use uuid::Uuid;

/// Root of every live log channel
pub const PREFIX: &str = "shipyard/logs/";

/// Channel patterns for the live log bus
pub struct Topics;

impl Topics {
    /// Channel a single deployment publishes to
    pub fn deployment_logs(project_id: &Uuid, deployment_id: &Uuid) -> String {
        format!("{}{}/{}", PREFIX, project_id, deployment_id)
    }

    /// Pattern matching every deployment of a project
    pub fn project_logs(project_id: &Uuid) -> String {
        format!("{}{}/+", PREFIX, project_id)
    }

    /// Pattern matching every log channel
    pub fn all_logs() -> String {
        "shipyard/logs/#".to_string()
    }

    /// Whether a viewer may subscribe to `pattern`.
    ///
    /// Accepted: `shipyard/logs/#`, or a project level (id or `+`) followed
    /// by a deployment level (id, `+` or `#`).
    pub fn is_viewer_pattern(pattern: &str) -> bool {
        let Some(rest) = pattern.strip_prefix(PREFIX) else {
            return false;
        };
        let levels: Vec<&str> = rest.split('/').collect();
        match levels.as_slice() {
            ["#"] => true,
            [project, deployment] => {
                (*project == "+" || project.parse::<Uuid>().is_ok())
                    && (matches!(*deployment, "+" | "#") || deployment.parse::<Uuid>().is_ok())
            }
            _ => false,
        }
    }
}

/// MQTT-style pattern match: `+` matches one level, a trailing `#` matches
/// the remaining levels (including none).
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (pattern_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return pattern_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
