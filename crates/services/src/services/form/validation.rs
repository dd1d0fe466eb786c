//! Request validation rules derived from a form schema.

use std::{collections::BTreeMap, convert::Infallible, fmt, str::FromStr};

use db::models::record::Record;

use super::schema::{self, Component, ComponentRef, Field};

/// `unique` exception for the record being edited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIgnore {
    pub key: String,
    pub key_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Rule {
    Required,
    Nullable,
    Min(f64),
    Max(f64),
    Regex(String),
    Numeric,
    Email,
    Array,
    Unique {
        table: String,
        column: String,
        ignore: Option<UniqueIgnore>,
    },
    Other(String),
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => f.write_str("required"),
            Self::Nullable => f.write_str("nullable"),
            Self::Min(n) => write!(f, "min:{n}"),
            Self::Max(n) => write!(f, "max:{n}"),
            Self::Regex(pattern) => write!(f, "regex:/{pattern}/"),
            Self::Numeric => f.write_str("numeric"),
            Self::Email => f.write_str("email"),
            Self::Array => f.write_str("array"),
            Self::Unique {
                table,
                column,
                ignore: None,
            } => write!(f, "unique:{table},{column}"),
            Self::Unique {
                table,
                column,
                ignore: Some(ignore),
            } => write!(
                f,
                "unique:{table},{column},{},{}",
                ignore.key, ignore.key_name
            ),
            Self::Other(rule) => f.write_str(rule),
        }
    }
}

impl FromStr for Rule {
    type Err = Infallible;

    /// Unrecognised or malformed rules are kept verbatim as [`Rule::Other`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, args) = match s.split_once(':') {
            Some((name, args)) => (name, Some(args)),
            None => (s, None),
        };

        let rule = match (name, args) {
            ("required", None) => Self::Required,
            ("nullable", None) => Self::Nullable,
            ("numeric", None) => Self::Numeric,
            ("email", None) => Self::Email,
            ("array", None) => Self::Array,
            ("min", Some(n)) => n.parse().map_or_else(|_| Self::Other(s.to_string()), Self::Min),
            ("max", Some(n)) => n.parse().map_or_else(|_| Self::Other(s.to_string()), Self::Max),
            ("regex", Some(pattern)) => Self::Regex(
                pattern
                    .strip_prefix('/')
                    .and_then(|p| p.strip_suffix('/'))
                    .unwrap_or(pattern)
                    .to_string(),
            ),
            ("unique", Some(args)) => {
                let parts: Vec<&str> = args.split(',').map(str::trim).collect();
                match parts.as_slice() {
                    [table, column] => Self::Unique {
                        table: table.to_string(),
                        column: column.to_string(),
                        ignore: None,
                    },
                    [table, column, key] => Self::Unique {
                        table: table.to_string(),
                        column: column.to_string(),
                        ignore: Some(UniqueIgnore {
                            key: key.to_string(),
                            key_name: "id".to_string(),
                        }),
                    },
                    [table, column, key, key_name] => Self::Unique {
                        table: table.to_string(),
                        column: column.to_string(),
                        ignore: Some(UniqueIgnore {
                            key: key.to_string(),
                            key_name: key_name.to_string(),
                        }),
                    },
                    _ => Self::Other(s.to_string()),
                }
            }
            _ => Self::Other(s.to_string()),
        };
        Ok(rule)
    }
}

impl From<&str> for Rule {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(rule) => rule,
            Err(never) => match never {},
        }
    }
}

/// Bounds a field kind contributes to validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationAttributes {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<String>,
    pub numeric: bool,
    pub email: bool,
    pub array: bool,
}

impl ValidationAttributes {
    pub fn rules(&self) -> Vec<Rule> {
        let mut rules = Vec::new();
        if self.numeric {
            rules.push(Rule::Numeric);
        }
        if self.email {
            rules.push(Rule::Email);
        }
        if self.array {
            rules.push(Rule::Array);
        }
        if let Some(len) = self.min_length {
            rules.push(Rule::Min(len as f64));
        }
        if let Some(len) = self.max_length {
            rules.push(Rule::Max(len as f64));
        }
        if let Some(min) = self.min {
            rules.push(Rule::Min(min));
        }
        if let Some(max) = self.max {
            rules.push(Rule::Max(max));
        }
        if let Some(pattern) = &self.pattern {
            rules.push(Rule::Regex(pattern.clone()));
        }
        rules
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormMode {
    Create,
    Edit { key: i64, key_name: String },
}

impl FormMode {
    /// `Edit` for a persisted record, `Create` otherwise.
    pub fn for_record(record: &Record) -> Self {
        match record.key() {
            Some(key) if record.exists() => Self::Edit {
                key,
                key_name: record.key_name().to_string(),
            },
            _ => Self::Create,
        }
    }
}

/// Rules keyed by field path; repeated items use `*` for their index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleSet {
    rules: BTreeMap<String, Vec<Rule>>,
}

impl RuleSet {
    pub fn get(&self, path: &str) -> Option<&[Rule]> {
        self.rules.get(path).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Rule])> {
        self.rules
            .iter()
            .map(|(path, rules)| (path.as_str(), rules.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn to_strings(&self) -> BTreeMap<String, Vec<String>> {
        self.rules
            .iter()
            .map(|(path, rules)| (path.clone(), rules.iter().map(Rule::to_string).collect()))
            .collect()
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<Rule>> {
        self.rules
    }
}

pub fn extract_rules(schema: &[Component], mode: &FormMode) -> RuleSet {
    let mut rules = BTreeMap::new();
    for (path, component) in schema::flatten(schema) {
        match component {
            ComponentRef::Field(field) if field.is_dehydrated() => {
                rules.insert(path, field_rules(field, mode));
            }
            ComponentRef::Fieldset(fieldset) => {
                let presence = if fieldset.is_required() {
                    Rule::Required
                } else {
                    Rule::Nullable
                };
                rules.insert(path, vec![presence, Rule::Array]);
            }
            _ => {}
        }
    }
    RuleSet { rules }
}

/// Declared rules, then the kind's attribute rules, with the presence rule
/// in front.
pub fn field_rules(field: &Field, mode: &FormMode) -> Vec<Rule> {
    let mut rules = field.declared_rules().to_vec();
    for rule in field.validation_attributes().rules() {
        if !rules.contains(&rule) {
            rules.push(rule);
        }
    }

    if let FormMode::Edit { key, key_name } = mode {
        for rule in &mut rules {
            if let Rule::Unique { ignore, .. } = rule {
                if ignore.is_none() {
                    *ignore = Some(UniqueIgnore {
                        key: key.to_string(),
                        key_name: key_name.clone(),
                    });
                }
            }
        }
    }

    if field.is_required() {
        if !rules.contains(&Rule::Required) {
            rules.insert(0, Rule::Required);
        }
    } else if !rules.contains(&Rule::Nullable) && !rules.contains(&Rule::Required) {
        rules.insert(0, Rule::Nullable);
    }
    rules
}

#[cfg(test)]
mod tests {
    use db::{DBService, models::record::ModelDefinition};
    use serde_json::json;

    use super::*;
    use crate::services::form::schema::{Fieldset, Group};

    fn strings(set: &RuleSet, path: &str) -> Vec<String> {
        set.get(path)
            .unwrap_or_else(|| panic!("no rules for {path}"))
            .iter()
            .map(Rule::to_string)
            .collect()
    }

    #[test]
    fn optional_text_gets_nullable_and_its_length() {
        let schema = vec![Component::from(Field::text("bio").min_length(10))];
        let rules = extract_rules(&schema, &FormMode::Create);
        assert_eq!(strings(&rules, "bio"), vec!["nullable", "min:10"]);
    }

    #[test]
    fn required_text_gets_required_first() {
        let schema = vec![Component::from(Field::text("bio").min_length(10).required())];
        let rules = extract_rules(&schema, &FormMode::Create);
        assert_eq!(strings(&rules, "bio"), vec!["required", "min:10"]);
    }

    #[test]
    fn declared_rules_precede_attribute_rules() {
        let schema = vec![
            Component::from(
                Field::text("slug")
                    .rule("alpha_dash")
                    .max_length(50)
                    .pattern("^[a-z-]+$")
                    .required(),
            ),
            Field::number("price").min(0.5).max(100.0).into(),
            Field::email("contact").rule("nullable").into(),
        ];
        let rules = extract_rules(&schema, &FormMode::Create);

        assert_eq!(
            strings(&rules, "slug"),
            vec!["required", "alpha_dash", "max:50", "regex:/^[a-z-]+$/"]
        );
        assert_eq!(
            strings(&rules, "price"),
            vec!["nullable", "numeric", "min:0.5", "max:100"]
        );
        assert_eq!(strings(&rules, "contact"), vec!["nullable", "email"]);
    }

    #[test]
    fn repeatable_children_use_wildcards() {
        let schema = vec![
            Component::from(
                Fieldset::new("a")
                    .required()
                    .child(Group::new("seo").child(Field::text("title").required()))
                    .child(Group::new("g").child(Fieldset::new("b").child(Field::text("x")))),
            ),
            Group::layout().child(Field::toggle("published")).into(),
        ];
        let rules = extract_rules(&schema, &FormMode::Create);

        assert_eq!(strings(&rules, "a"), vec!["required", "array"]);
        assert_eq!(strings(&rules, "a.*.seo.title"), vec!["required"]);
        assert_eq!(strings(&rules, "a.*.g.b"), vec!["nullable", "array"]);
        assert_eq!(strings(&rules, "a.*.g.b.*.x"), vec!["nullable"]);
        assert_eq!(strings(&rules, "published"), vec!["nullable"]);
        assert_eq!(rules.len(), 5);
    }

    #[test]
    fn skips_non_dehydrated_and_honours_overrides() {
        let schema = vec![
            Component::from(Field::text("confirm").dehydrated(false).required()),
            Field::text("title").state_path("meta.title").into(),
        ];
        let rules = extract_rules(&schema, &FormMode::Create);

        assert!(rules.get("confirm").is_none());
        assert_eq!(strings(&rules, "meta.title"), vec!["nullable"]);
    }

    #[test]
    fn edit_mode_ignores_the_current_record() {
        let schema = vec![
            Component::from(Field::text("slug").unique("posts", "slug").required()),
            Field::text("code").rule("unique:posts,code,1,uuid").into(),
        ];
        let mode = FormMode::Edit {
            key: 7,
            key_name: "id".to_string(),
        };
        let rules = extract_rules(&schema, &mode);

        assert_eq!(strings(&rules, "slug"), vec!["required", "unique:posts,slug,7,id"]);
        assert_eq!(
            strings(&rules, "code"),
            vec!["nullable", "unique:posts,code,1,uuid"]
        );

        let create = extract_rules(&schema, &FormMode::Create);
        assert_eq!(strings(&create, "slug"), vec!["required", "unique:posts,slug"]);
    }

    #[test]
    fn multiple_media_is_an_array() {
        let schema = vec![Component::from(Field::media("gallery").multiple())];
        let rules = extract_rules(&schema, &FormMode::Create);
        assert_eq!(strings(&rules, "gallery"), vec!["nullable", "array"]);
    }

    #[test]
    fn parses_laravel_strings() {
        assert_eq!(Rule::from("min:10"), Rule::Min(10.0));
        assert_eq!(Rule::from("regex:/^a+$/"), Rule::Regex("^a+$".to_string()));
        assert_eq!(
            Rule::from("unique:posts,slug,7"),
            Rule::Unique {
                table: "posts".to_string(),
                column: "slug".to_string(),
                ignore: Some(UniqueIgnore {
                    key: "7".to_string(),
                    key_name: "id".to_string(),
                }),
            }
        );
        assert_eq!(Rule::from("min:ten"), Rule::Other("min:ten".to_string()));
        assert_eq!(Rule::from("alpha_dash").to_string(), "alpha_dash");
    }

    #[tokio::test]
    async fn mode_follows_record_state() {
        let db = DBService::new_in_memory().await.unwrap();
        sqlx::query("CREATE TABLE posts (id INTEGER PRIMARY KEY, title TEXT)")
            .execute(&db.pool)
            .await
            .unwrap();

        let mut record = Record::new(ModelDefinition::new("posts").into_shared());
        record.set_attribute("title", json!("Hello"));
        assert_eq!(FormMode::for_record(&record), FormMode::Create);

        record.save(&db.pool).await.unwrap();
        let key = record.key().unwrap();
        assert_eq!(
            FormMode::for_record(&record),
            FormMode::Edit {
                key,
                key_name: "id".to_string()
            }
        );
    }
}
