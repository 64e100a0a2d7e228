pub mod config;
pub mod query;

use crate::config::{AddTripleConfig, ConfigError};
use crate::query::{ParsedQuery, build_query};
use regex::Regex;
use shared::backend::Backend;
use shared::response::BackendResponse;
use std::sync::{Arc, LazyLock};
use std::time::Instant;

static RESULTSIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""resultsize"\s*:\s*(\d+)"#).expect("static regex"));

/// The name service rewrites a SPARQL query so that id columns gain
/// human-readable companions (labels, images, coordinates).
///
/// Terminology: an *id variable* stands for entities that have a name via a
/// configured predicate; a *name variable* stands for the literals naming
/// them; a *name triple* is `<id variable> <predicate> <name variable>`.
/// Whether a name triple is worth adding is discovered by probing the
/// backend, never by guessing.
pub struct NameService {
    backend: Arc<Backend>,
    subject_var_suffix: String,
    configs: Vec<AddTripleConfig>,
}

impl NameService {
    /// Build a name service over the given probe backend.
    ///
    /// Suffix combinations under which a renamed id variable would collide
    /// with the variable being added are rejected here; letting them through
    /// would only fail later, on the first query that probes successfully.
    pub fn new(
        backend: Arc<Backend>,
        subject_var_suffix: impl Into<String>,
        configs: Vec<AddTripleConfig>,
    ) -> Result<Self, ConfigError> {
        let subject_var_suffix = subject_var_suffix.into();
        for config in &configs {
            let collides = if subject_var_suffix.is_empty() {
                config.suffix.is_empty()
            } else {
                config.suffix == subject_var_suffix
            };
            if collides {
                return Err(ConfigError::SuffixCollision {
                    subject_var_suffix,
                    suffix: config.suffix.clone(),
                });
            }
        }
        Ok(NameService {
            backend,
            subject_var_suffix,
            configs,
        })
    }

    pub fn configs(&self) -> &[AddTripleConfig] {
        &self.configs
    }

    /// Enhance a query by adding every name triple that (a) is not already
    /// present and (b) demonstrably produces results. Never fails: parse or
    /// probe problems degrade to fewer (or no) added triples, and the result
    /// is always a complete query string.
    pub async fn enhance_query(&self, sparql_query: &str) -> String {
        tracing::info!("Name service: check which name triples can be added");
        let start_time = Instant::now();

        let Some(parts) = ParsedQuery::parse(sparql_query) else {
            tracing::error!("Name service: query unchanged");
            return sparql_query.to_string();
        };
        let ParsedQuery {
            prefixes,
            mut select_vars_string,
            select_vars,
            mut body,
            mut group_by,
            footer,
        } = parts;

        let mut new_select_vars = select_vars.clone();
        let mut new_triples: Vec<String> = Vec::new();
        // Insertions left of the end shift every later subject's slot.
        let mut num_vars_added: usize = 0;
        let mut num_added_per_config = vec![0usize; self.configs.len()];

        for (var_index, original_var) in select_vars.iter().enumerate() {
            // Renamed at most once, no matter how many triples get added.
            let mut var = original_var.clone();
            let mut var_has_been_renamed = false;

            for (config_index, config) in self.configs.iter().enumerate() {
                if let Some(position) = config.select_variable_position {
                    let resolved = if position >= 0 {
                        position
                    } else {
                        select_vars.len() as i64 + position
                    };
                    if var_index as i64 != resolved {
                        continue;
                    }
                }

                // An equivalent name triple already in the query suppresses
                // both the probe and the addition.
                if predicate_exists(&var, &config.predicate_exists_regex, &body) {
                    continue;
                }

                // Probe whether adding the triple yields any result. The
                // ORDER BY on the subject works around an upstream bug with
                // single-triple inner queries; keep it.
                let group_by_probe = format!("{group_by}ORDER BY {var} ");
                let test_var = format!("{}{}_test", var, config.suffix);
                let test_triple = format!("  {} {} {}", var, config.predicate, test_var);
                let test_query = build_query(
                    &prefixes,
                    std::slice::from_ref(&test_var),
                    std::slice::from_ref(&test_triple),
                    &select_vars_string,
                    &body,
                    &group_by_probe,
                    "LIMIT 1",
                );
                tracing::debug!(
                    "Test if adding \"{}\" gives a result\n{}",
                    test_triple.trim_start(),
                    test_query
                );

                let probe_path = format!("/?query={}", urlencoding::encode(&test_query));
                let response = self
                    .backend
                    .query(&probe_path, self.backend.timeout(), Some(false))
                    .await;
                if !probe_has_results(&response) {
                    continue;
                }

                if !self.subject_var_suffix.is_empty() && !var_has_been_renamed {
                    var = format!("{original_var}{}", self.subject_var_suffix);
                    tracing::info!("Renaming {original_var} to {var}");
                    new_select_vars[var_index + num_vars_added] = var.clone();
                    // Whole-word match so that ?x does not hit ?x_other.
                    match whole_word_regex(original_var) {
                        Ok(var_re) => {
                            body = var_re.replace_all(&body, var.as_str()).into_owned();
                            group_by = var_re.replace_all(&group_by, var.as_str()).into_owned();
                            select_vars_string = var_re
                                .replace_all(&select_vars_string, var.as_str())
                                .into_owned();
                        }
                        Err(e) => {
                            tracing::error!("Cannot rename {original_var}: {e}");
                            var = original_var.clone();
                        }
                    }
                    var_has_been_renamed = true;
                }

                let new_var = format!("{original_var}{}", config.suffix);
                debug_assert_ne!(var, new_var);

                let mut new_triple = format!("{} {} {}", var, config.predicate, new_var);
                if config.optional {
                    new_triple = format!("OPTIONAL {{ {new_triple} }}");
                }
                tracing::info!("Adding triple \"{new_triple}\"");
                new_triples.push(format!("  {new_triple}"));

                let position = if num_added_per_config[config_index] == 0 {
                    config.position
                } else {
                    config.position_repeated
                };
                if position == 0 {
                    // Replace the id variable by the name variable.
                    new_select_vars[var_index + num_vars_added] = new_var;
                } else if position > 0 {
                    // Insert right of the subject; +1 is directly adjacent.
                    num_vars_added += 1;
                    let pos = var_index + num_vars_added + position as usize - 1;
                    let pos = pos.min(new_select_vars.len());
                    new_select_vars.insert(pos, new_var);
                } else {
                    // Append counting from the end; -1 is the very end. Not
                    // counted toward num_vars_added.
                    let pos = new_select_vars.len() as i64 + position + 1;
                    let pos = pos.clamp(0, new_select_vars.len() as i64) as usize;
                    new_select_vars.insert(pos, new_var);
                }
                tracing::debug!("New select var list: {}", new_select_vars.join(" "));

                num_added_per_config[config_index] += 1;
            }
        }

        let enhanced_query = build_query(
            &prefixes,
            &new_select_vars,
            &new_triples,
            &select_vars_string,
            &body,
            &group_by,
            &footer,
        );
        tracing::info!(
            "Total time spent on name service: {}ms",
            start_time.elapsed().as_millis()
        );
        enhanced_query
    }
}

/// Does the body already contain a triple `<var> <matching predicate> ...`?
fn predicate_exists(var: &str, predicate_pattern: &str, body: &str) -> bool {
    let var_escaped = var.replace('?', r"\?");
    match Regex::new(&format!(r"{var_escaped}\s+{predicate_pattern}")) {
        Ok(re) => re.is_match(body),
        Err(e) => {
            tracing::error!("Bad predicate existence regex for {var}: {e}");
            false
        }
    }
}

fn whole_word_regex(var: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!(r"{}\b", var.replace('?', r"\?")))
}

/// A probe succeeds iff the backend answered 200 with a positive
/// `"resultsize"` somewhere in the body.
fn probe_has_results(response: &BackendResponse) -> bool {
    let BackendResponse::Ok { body, .. } = response else {
        return false;
    };
    let body_text = String::from_utf8_lossy(body);
    RESULTSIZE_RE
        .captures(&body_text)
        .and_then(|captures| captures[1].parse::<u64>().ok())
        .is_some_and(|resultsize| resultsize > 0)
}
