/// Conversions from actions to container runtime inputs
use crate::action::Env;

const NAME_PREFIX: &str = "tinkerbell";
const SUFFIX_LEN: usize = 6;

/// Generate a unique container name for an action.
///
/// The name is `tinkerbell_<name>_<id>_<suffix>` where every character outside
/// `[a-zA-Z0-9_.-]` in `name` and `id` is replaced by `_`. The fixed prefix guarantees a
/// valid first character; the random suffix keeps retries from colliding.
pub fn container_name(action_id: &str, action_name: &str) -> String {
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(SUFFIX_LEN)
        .collect();
    format!(
        "{}_{}_{}_{}",
        NAME_PREFIX,
        sanitize(action_name),
        sanitize(action_id),
        suffix
    )
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Flatten env pairs into `KEY=VALUE` strings, order preserved.
pub fn flatten_env(env: &[Env]) -> Vec<String> {
    env.iter()
        .map(|e| format!("{}={}", e.key, e.value))
        .collect()
}
