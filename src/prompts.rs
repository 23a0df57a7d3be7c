//! Prompt templates: storage, validation and rendering
//!
//! Templates substitute `{name}` placeholders (`{{`/`}}` escape to
//! literal braces) and may declare a context strategy that packs
//! retrieved chunks into the `context` variable under a length budget.

use crate::error::{RagError, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

/// The well-known variable context packing binds to
pub const CONTEXT_VARIABLE: &str = "context";

/// Template purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    RagQuery,
    QuestionGeneration,
    ResponseEvaluation,
    CotReasoning,
    Custom,
    PodcastGeneration,
}

impl std::fmt::Display for TemplateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::RagQuery => "rag_query",
            Self::QuestionGeneration => "question_generation",
            Self::ResponseEvaluation => "response_evaluation",
            Self::CotReasoning => "cot_reasoning",
            Self::Custom => "custom",
            Self::PodcastGeneration => "podcast_generation",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for TemplateType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "rag_query" => Ok(Self::RagQuery),
            "question_generation" => Ok(Self::QuestionGeneration),
            "response_evaluation" => Ok(Self::ResponseEvaluation),
            "cot_reasoning" => Ok(Self::CotReasoning),
            "custom" => Ok(Self::Custom),
            "podcast_generation" => Ok(Self::PodcastGeneration),
            other => Err(format!("unknown template type: {other}")),
        }
    }
}

/// How to shorten over-long packed context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TruncationMode {
    End,
    Start,
    Middle,
}

/// Context packing strategy
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ContextStrategy {
    /// Keep at most this many chunks
    pub max_chunks: usize,

    /// Separator between chunks
    #[serde(default = "default_separator")]
    pub chunk_separator: String,

    /// Which side to cut when over budget
    #[serde(default = "default_truncation")]
    pub truncation: TruncationMode,
}

fn default_separator() -> String {
    "\n\n".to_string()
}

fn default_truncation() -> TruncationMode {
    TruncationMode::End
}

/// A stored prompt template
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PromptTemplate {
    pub id: Uuid,
    pub user_id: Uuid,
    pub template_type: TemplateType,
    pub name: String,
    pub system_prompt: Option<String>,
    /// Format string with `{var}` placeholders
    pub template_format: String,
    /// Declared variables: name -> description
    pub input_variables: HashMap<String, String>,
    pub context_strategy: Option<ContextStrategy>,
    /// Character budget for the packed context
    pub max_context_length: Option<usize>,
    pub stop_sequences: Vec<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([a-zA-Z_][a-zA-Z0-9_]*)\}").expect("placeholder regex"))
}

impl PromptTemplate {
    /// Placeholders appearing in the format string
    pub fn placeholders(&self) -> HashSet<String> {
        // Mask escaped braces so `{{literal}}` is not read as a placeholder.
        let masked = self.template_format.replace("{{", "\u{0}").replace("}}", "\u{0}");
        placeholder_regex()
            .captures_iter(&masked)
            .map(|c| c[1].to_string())
            .collect()
    }

    /// Every placeholder must be declared in `input_variables`
    pub fn validate(&self) -> Result<()> {
        let declared: HashSet<&str> = self.input_variables.keys().map(|k| k.as_str()).collect();
        for placeholder in self.placeholders() {
            if !declared.contains(placeholder.as_str()) {
                return Err(RagError::Validation(format!(
                    "placeholder '{{{placeholder}}}' is not declared in input_variables"
                )));
            }
        }
        Ok(())
    }

    /// Whether the template declares a given variable
    pub fn declares(&self, variable: &str) -> bool {
        self.input_variables.contains_key(variable)
    }

    /// Render the template with the given variables
    ///
    /// Fails with `MissingPromptVariable` on the first unbound
    /// placeholder. When the template carries a system prompt it is
    /// prepended, separated by a blank line.
    pub fn render(&self, variables: &HashMap<String, String>) -> Result<String> {
        let mut out = String::with_capacity(self.template_format.len());
        let mut chars = self.template_format.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    for inner in chars.by_ref() {
                        if inner == '}' {
                            break;
                        }
                        name.push(inner);
                    }
                    let value = variables
                        .get(&name)
                        .ok_or_else(|| RagError::MissingPromptVariable(name.clone()))?;
                    out.push_str(value);
                }
                other => out.push(other),
            }
        }

        match &self.system_prompt {
            Some(system) if !system.is_empty() => Ok(format!("{system}\n\n{out}")),
            _ => Ok(out),
        }
    }

    /// Pack candidate context chunks per the declared strategy
    ///
    /// Truncates the chunk list to `max_chunks`, joins with the
    /// separator, then shortens the joined string to
    /// `max_context_length` characters per the truncation mode.
    pub fn pack_context(&self, chunks: &[String]) -> String {
        let strategy = match &self.context_strategy {
            Some(strategy) => strategy,
            None => return chunks.join(&default_separator()),
        };

        let kept: Vec<&String> = chunks.iter().take(strategy.max_chunks.max(1)).collect();
        let joined = kept
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join(&strategy.chunk_separator);

        let budget = match self.max_context_length {
            Some(budget) if joined.chars().count() > budget => budget,
            _ => return joined,
        };

        let chars: Vec<char> = joined.chars().collect();
        match strategy.truncation {
            TruncationMode::End => chars[..budget].iter().collect(),
            TruncationMode::Start => chars[chars.len() - budget..].iter().collect(),
            TruncationMode::Middle => {
                let ellipsis = "...";
                let keep = budget.saturating_sub(ellipsis.len());
                let head = keep / 2 + keep % 2;
                let tail = keep / 2;
                let mut out: String = chars[..head].iter().collect();
                out.push_str(ellipsis);
                out.extend(chars[chars.len() - tail..].iter());
                out
            }
        }
    }
}

/// The built-in RAG template used when a user has none
pub fn builtin_rag_template(user_id: Uuid) -> PromptTemplate {
    let mut input_variables = HashMap::new();
    input_variables.insert(
        "context".to_string(),
        "Retrieved passages relevant to the question".to_string(),
    );
    input_variables.insert("question".to_string(), "The user's question".to_string());

    PromptTemplate {
        id: Uuid::new_v4(),
        user_id,
        template_type: TemplateType::RagQuery,
        name: "default-rag".to_string(),
        system_prompt: Some(
            "You are a helpful assistant. Answer the question using only the provided context. \
             If the context does not contain the answer, say so."
                .to_string(),
        ),
        template_format: "Context:\n{context}\n\nQuestion: {question}\n\nAnswer:".to_string(),
        input_variables,
        context_strategy: Some(ContextStrategy {
            max_chunks: 5,
            chunk_separator: "\n\n".to_string(),
            truncation: TruncationMode::End,
        }),
        max_context_length: Some(8000),
        stop_sequences: Vec::new(),
        is_default: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

/// Repository over the prompt_templates table
#[derive(Clone)]
pub struct PromptTemplateRepository {
    pool: SqlitePool,
}

impl PromptTemplateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS prompt_templates (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                template_type TEXT NOT NULL,
                name TEXT NOT NULL,
                system_prompt TEXT,
                template_format TEXT NOT NULL,
                input_variables TEXT NOT NULL,
                context_strategy TEXT,
                max_context_length INTEGER,
                stop_sequences TEXT NOT NULL DEFAULT '[]',
                is_default INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store a template; making it default clears any previous default
    /// for the same (user, type).
    pub async fn save(&self, template: &PromptTemplate) -> Result<()> {
        template.validate()?;

        let mut tx = self.pool.begin().await?;

        if template.is_default {
            sqlx::query(
                "UPDATE prompt_templates SET is_default = 0 WHERE user_id = ?1 AND template_type = ?2",
            )
            .bind(template.user_id.to_string())
            .bind(template.template_type.to_string())
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO prompt_templates
                (id, user_id, template_type, name, system_prompt, template_format,
                 input_variables, context_strategy, max_context_length, stop_sequences,
                 is_default, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(template.id.to_string())
        .bind(template.user_id.to_string())
        .bind(template.template_type.to_string())
        .bind(&template.name)
        .bind(&template.system_prompt)
        .bind(&template.template_format)
        .bind(serde_json::to_string(&template.input_variables)?)
        .bind(
            template
                .context_strategy
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        )
        .bind(template.max_context_length.map(|l| l as i64))
        .bind(serde_json::to_string(&template.stop_sequences)?)
        .bind(template.is_default)
        .bind(template.created_at.to_rfc3339())
        .bind(template.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(
            "Saved prompt template '{}' ({}) for user {}",
            template.name, template.template_type, template.user_id
        );
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<PromptTemplate> {
        let row = sqlx::query("SELECT * FROM prompt_templates WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_template)
            .transpose()?
            .ok_or_else(|| RagError::NotFound(format!("prompt template {id}")))
    }

    /// The user's default template of a type, falling back to the
    /// built-in RAG template for `RagQuery`.
    pub async fn default_for(
        &self,
        user_id: Uuid,
        template_type: TemplateType,
    ) -> Result<PromptTemplate> {
        let row = sqlx::query(
            "SELECT * FROM prompt_templates WHERE user_id = ?1 AND template_type = ?2 AND is_default = 1",
        )
        .bind(user_id.to_string())
        .bind(template_type.to_string())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            return row_to_template(row);
        }

        if template_type == TemplateType::RagQuery {
            debug!("No stored RAG template for user {}; using built-in", user_id);
            return Ok(builtin_rag_template(user_id));
        }

        Err(RagError::NotFound(format!(
            "no default {template_type} template for user {user_id}"
        )))
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM prompt_templates WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RagError::NotFound(format!("prompt template {id}")));
        }
        Ok(())
    }
}

fn row_to_template(row: sqlx::sqlite::SqliteRow) -> Result<PromptTemplate> {
    let id: String = row.get("id");
    let user_id: String = row.get("user_id");
    let template_type: String = row.get("template_type");
    let input_variables: String = row.get("input_variables");
    let context_strategy: Option<String> = row.get("context_strategy");
    let max_context_length: Option<i64> = row.get("max_context_length");
    let stop_sequences: String = row.get("stop_sequences");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(PromptTemplate {
        id: Uuid::parse_str(&id).map_err(|e| RagError::Validation(e.to_string()))?,
        user_id: Uuid::parse_str(&user_id).map_err(|e| RagError::Validation(e.to_string()))?,
        template_type: template_type
            .parse()
            .map_err(|e: String| RagError::Validation(e))?,
        name: row.get("name"),
        system_prompt: row.get("system_prompt"),
        template_format: row.get("template_format"),
        input_variables: serde_json::from_str(&input_variables)?,
        context_strategy: context_strategy
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
        max_context_length: max_context_length.map(|l| l as usize),
        stop_sequences: serde_json::from_str(&stop_sequences)?,
        is_default: row.get("is_default"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map_err(|e| RagError::Validation(e.to_string()))?
            .with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map_err(|e| RagError::Validation(e.to_string()))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(format: &str, vars: &[&str]) -> PromptTemplate {
        let mut base = builtin_rag_template(Uuid::new_v4());
        base.template_format = format.to_string();
        base.system_prompt = None;
        base.input_variables = vars
            .iter()
            .map(|v| (v.to_string(), String::new()))
            .collect();
        base
    }

    #[test]
    fn test_placeholder_extraction() {
        let t = template("Hello {name}, {{not_a_var}}, bye {name}", &["name"]);
        let placeholders = t.placeholders();
        assert_eq!(placeholders.len(), 1);
        assert!(placeholders.contains("name"));
    }

    #[test]
    fn test_validation_catches_undeclared() {
        let t = template("Hi {name} and {other}", &["name"]);
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_render_deterministic() {
        let t = template("Q: {question}", &["question"]);
        let mut vars = HashMap::new();
        vars.insert("question".to_string(), "why?".to_string());
        let first = t.render(&vars).unwrap();
        let second = t.render(&vars).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, "Q: why?");
    }

    #[test]
    fn test_render_missing_variable() {
        let t = template("Q: {question}", &["question"]);
        let result = t.render(&HashMap::new());
        assert!(matches!(result, Err(RagError::MissingPromptVariable(v)) if v == "question"));
    }

    #[test]
    fn test_render_escaped_braces() {
        let t = template("literal {{braces}} and {v}", &["v"]);
        let mut vars = HashMap::new();
        vars.insert("v".to_string(), "x".to_string());
        assert_eq!(t.render(&vars).unwrap(), "literal {braces} and x");
    }

    #[test]
    fn test_system_prompt_prepended() {
        let mut t = template("{question}", &["question"]);
        t.system_prompt = Some("Be brief.".to_string());
        let mut vars = HashMap::new();
        vars.insert("question".to_string(), "hi".to_string());
        assert_eq!(t.render(&vars).unwrap(), "Be brief.\n\nhi");
    }

    #[test]
    fn test_pack_context_truncation_modes() {
        let chunks: Vec<String> = vec!["aaaa".into(), "bbbb".into(), "cccc".into()];

        let mut t = template("{context}", &["context"]);
        t.max_context_length = Some(7);

        t.context_strategy = Some(ContextStrategy {
            max_chunks: 3,
            chunk_separator: " ".to_string(),
            truncation: TruncationMode::End,
        });
        assert_eq!(t.pack_context(&chunks), "aaaa bb");

        t.context_strategy = Some(ContextStrategy {
            max_chunks: 3,
            chunk_separator: " ".to_string(),
            truncation: TruncationMode::Start,
        });
        assert_eq!(t.pack_context(&chunks), "bb cccc");

        t.context_strategy = Some(ContextStrategy {
            max_chunks: 3,
            chunk_separator: " ".to_string(),
            truncation: TruncationMode::Middle,
        });
        let middle = t.pack_context(&chunks);
        assert_eq!(middle.chars().count(), 7);
        assert!(middle.contains("..."));
        assert!(middle.starts_with("aa"));
        assert!(middle.ends_with("cc"));
    }

    #[test]
    fn test_pack_context_respects_max_chunks() {
        let chunks: Vec<String> = (0..10).map(|i| format!("chunk{i}")).collect();
        let mut t = template("{context}", &["context"]);
        t.max_context_length = None;
        t.context_strategy = Some(ContextStrategy {
            max_chunks: 2,
            chunk_separator: "|".to_string(),
            truncation: TruncationMode::End,
        });
        assert_eq!(t.pack_context(&chunks), "chunk0|chunk1");
    }

    #[tokio::test]
    async fn test_repository_single_default() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let repo = PromptTemplateRepository::new(pool);
        repo.initialize().await.unwrap();

        let user = Uuid::new_v4();
        let mut first = builtin_rag_template(user);
        first.name = "first".to_string();
        repo.save(&first).await.unwrap();

        let mut second = builtin_rag_template(user);
        second.name = "second".to_string();
        repo.save(&second).await.unwrap();

        let default = repo.default_for(user, TemplateType::RagQuery).await.unwrap();
        assert_eq!(default.name, "second");

        let stale = repo.get(first.id).await.unwrap();
        assert!(!stale.is_default);
    }

    #[tokio::test]
    async fn test_builtin_fallback() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let repo = PromptTemplateRepository::new(pool);
        repo.initialize().await.unwrap();

        let template = repo
            .default_for(Uuid::new_v4(), TemplateType::RagQuery)
            .await
            .unwrap();
        assert_eq!(template.name, "default-rag");
        assert!(template.validate().is_ok());

        assert!(repo
            .default_for(Uuid::new_v4(), TemplateType::CotReasoning)
            .await
            .is_err());
    }
}
