use regex::Regex;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "--add-triple argument must be of the form <predicate>|<suffix>|<position>, was: {0}"
    )]
    MalformedAddTriple(String),

    #[error("invalid position in --add-triple argument {arg}: {reason}")]
    InvalidPosition { arg: String, reason: String },

    #[error("predicate {predicate} does not form a valid existence regex: {reason}")]
    InvalidPredicateRegex { predicate: String, reason: String },

    #[error(
        "add-triple suffix {suffix:?} collides with subject variable suffix \
         {subject_var_suffix:?}; the renamed and the added variable would be identical"
    )]
    SuffixCollision {
        subject_var_suffix: String,
        suffix: String,
    },
}

/// Configuration for one kind of triple the name service may add to a query.
///
/// `position` places the new variable in the SELECT clause on the first use
/// of this config: `0` replaces the subject variable, a positive `k` inserts
/// `k` to the right of the subject, a negative `-k` appends counting from
/// the end (`-1` = last). `position_repeated` applies from the second use on
/// (label predicates replace the id column once a first label was added as a
/// new column).
#[derive(Clone, Debug)]
pub struct AddTripleConfig {
    pub predicate: String,
    pub suffix: String,
    pub position: i64,
    pub position_repeated: i64,
    pub optional: bool,
    /// Pattern matched against `<subject> <predicate>` in the query body to
    /// decide whether an equivalent triple already exists. Purely textual;
    /// prefix expansions are not normalised.
    pub predicate_exists_regex: String,
    /// When set, this config only applies to the projected variable at this
    /// SELECT position (negative values count from the end).
    pub select_variable_position: Option<i64>,
}

impl AddTripleConfig {
    pub fn new(predicate: &str, suffix: &str, position: i64) -> Result<Self, ConfigError> {
        // Default existence pattern: the full predicate, or any prefix
        // followed by the IRI's local name (e.g. <.../P18> also matches
        // wdt:P18). The predicate is used verbatim, metacharacters and all.
        let localname_re = Regex::new(r"^.*[/#](.*)>").expect("static regex");
        let local = localname_re.replace(predicate, r"\S+:${1}");
        let predicate_exists_regex = format!("({predicate}|{local})");
        Regex::new(&predicate_exists_regex).map_err(|e| ConfigError::InvalidPredicateRegex {
            predicate: predicate.to_string(),
            reason: e.to_string(),
        })?;

        let mut config = AddTripleConfig {
            predicate: predicate.to_string(),
            suffix: suffix.to_string(),
            position,
            position_repeated: position,
            optional: false,
            predicate_exists_regex,
            select_variable_position: None,
        };

        // Label predicates add the first label as a new column and replace
        // the id column from the second label on.
        if config.predicate.contains("label") {
            config.position_repeated = 0;
        }

        // Images and coordinates may be missing for most entities, and only
        // make sense for one SELECT position each.
        if config.suffix == "_image" || config.suffix == "_coords" {
            config.optional = true;
        }
        if config.suffix == "_image" {
            config.select_variable_position = Some(0);
        } else if config.suffix == "_coords" {
            config.select_variable_position = Some(-1);
        }

        Ok(config)
    }

    /// Parse a `--add-triple` command line argument of the form
    /// `<predicate>|<suffix>|<position>`.
    pub fn parse(arg: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = arg.split('|').collect();
        if parts.len() != 3 {
            return Err(ConfigError::MalformedAddTriple(arg.to_string()));
        }
        let position = parts[2]
            .trim()
            .parse::<i64>()
            .map_err(|e| ConfigError::InvalidPosition {
                arg: arg.to_string(),
                reason: e.to_string(),
            })?;
        AddTripleConfig::new(parts[0], parts[1], position)
    }
}

impl fmt::Display for AddTripleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let suffix = if self.suffix.is_empty() {
            "None"
        } else {
            &self.suffix
        };
        write!(
            f,
            "{}, suffix: {}, position: {}, optional: {}",
            self.predicate, suffix, self.position, self.optional
        )
    }
}
