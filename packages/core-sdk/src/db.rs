use std::{cmp::Reverse, collections::HashMap, str::FromStr};

use anyhow::{bail, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    error::TemplateError,
    models::{ChatSession, PromptRecord, PromptTemplate, VariableSpec},
    store::{to_body, DocId, Document, DocumentStore, Filter, Patch},
    template::{render_with_policy, validate_template, RenderPolicy},
};

pub const PROMPTS: &str = "prompts";
pub const TEMPLATES: &str = "prompt_templates";
pub const CHAT_SESSIONS: &str = "chat_sessions";
pub const APP_CONFIG: &str = "app_config";

const TELEMETRY_KEY: &str = "telemetry_enabled";

trait Identified: DeserializeOwned {
    fn set_id(&mut self, id: DocId);
}

impl Identified for PromptRecord {
    fn set_id(&mut self, id: DocId) {
        self.id = Some(id);
    }
}

impl Identified for PromptTemplate {
    fn set_id(&mut self, id: DocId) {
        self.id = Some(id);
    }
}

impl Identified for ChatSession {
    fn set_id(&mut self, id: DocId) {
        self.id = Some(id);
    }
}

fn load<T: Identified>(doc: &Document) -> Result<T> {
    let mut value: T = doc.decode()?;
    value.set_id(doc.id);
    Ok(value)
}

fn load_all<T: Identified>(docs: Vec<Document>) -> Result<Vec<T>> {
    docs.iter().map(load).collect()
}

fn timestamp(at: OffsetDateTime) -> Result<Value> {
    Ok(Value::String(at.format(&Rfc3339)?))
}

/* ---------- 系统提示词 ---------- */

/**
 * \brief 规范化标签：去首尾空白、丢弃空串、按首次出现去重。
 */
pub fn normalize_tags<I, S>(tags: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.as_ref().trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_string());
        }
    }
    out
}

pub fn insert_prompt(
    store: &dyn DocumentStore,
    name: &str,
    content: &str,
    tags: &[String],
) -> Result<DocId> {
    let name = name.trim();
    if name.is_empty() {
        bail!("prompt name must not be empty");
    }
    let record = PromptRecord {
        id: None,
        name: name.to_string(),
        content: content.to_string(),
        tags: normalize_tags(tags),
        created_at: OffsetDateTime::now_utc(),
        last_used: None,
        used_count: 0,
    };
    let id = store.insert(PROMPTS, to_body(&record)?)?;
    tracing::info!(id, name, "prompt saved");
    Ok(id)
}

/**
 * \brief 列出全部提示词，最新创建的在前。
 */
pub fn list_prompts(store: &dyn DocumentStore) -> Result<Vec<PromptRecord>> {
    let mut prompts: Vec<PromptRecord> = load_all(store.find(PROMPTS, &Filter::all())?)?;
    prompts.sort_by_key(|p| Reverse((p.created_at, p.id)));
    Ok(prompts)
}

pub fn get_prompt(store: &dyn DocumentStore, id: DocId) -> Result<Option<PromptRecord>> {
    store
        .find_one(PROMPTS, &Filter::by_id(id))?
        .as_ref()
        .map(load)
        .transpose()
}

pub fn update_prompt(
    store: &dyn DocumentStore,
    id: DocId,
    name: &str,
    content: &str,
    tags: &[String],
) -> Result<bool> {
    let name = name.trim();
    if name.is_empty() {
        bail!("prompt name must not be empty");
    }
    let patch = Patch::new()
        .set("name", name)
        .set("content", content)
        .set("tags", normalize_tags(tags));
    store.update_one(PROMPTS, &Filter::by_id(id), &patch)
}

pub fn delete_prompt(store: &dyn DocumentStore, id: DocId) -> Result<bool> {
    store.delete_one(PROMPTS, &Filter::by_id(id))
}

/**
 * \brief 记录一次使用：计数加一并刷新最近使用时间。
 */
pub fn mark_prompt_used(store: &dyn DocumentStore, id: DocId) -> Result<bool> {
    let patch = Patch::new()
        .inc("used_count", 1)
        .set("last_used", timestamp(OffsetDateTime::now_utc())?);
    store.update_one(PROMPTS, &Filter::by_id(id), &patch)
}

/* ---------- 模板 ---------- */

/**
 * \brief 新建或更新模板时的输入。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub name: String,
    pub template_content: String,
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSort {
    #[default]
    Newest,
    NameAsc,
    MostUsed,
}

impl FromStr for TemplateSort {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "newest" => Ok(TemplateSort::Newest),
            "name" | "name_asc" => Ok(TemplateSort::NameAsc),
            "most_used" | "used" => Ok(TemplateSort::MostUsed),
            other => Err(format!("unknown sort order `{}`", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TemplateQuery {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub sort: TemplateSort,
}

fn checked_name(name: &str) -> Result<String, TemplateError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(TemplateError::EmptyName);
    }
    Ok(name.to_string())
}

/** \brief 同名模板冲突条件；重名检查与写入在存储内原子完成。 */
fn same_name(name: &str) -> Filter {
    Filter::all().eq("name", name)
}

/**
 * \brief 保存新模板。名称为空、重名或引用了未声明的变量时拒绝。
 */
pub fn insert_template(store: &dyn DocumentStore, draft: &TemplateDraft) -> Result<DocId> {
    let name = checked_name(&draft.name)?;
    validate_template(&draft.template_content, &draft.variables).ensure_savable()?;

    let now = OffsetDateTime::now_utc();
    let template = PromptTemplate {
        id: None,
        name,
        template_content: draft.template_content.clone(),
        variables: draft.variables.clone(),
        description: draft.description.clone(),
        created_at: now,
        updated_at: now,
        used_count: 0,
    };
    let id = store
        .insert_unless(TEMPLATES, &same_name(&template.name), to_body(&template)?)?
        .ok_or_else(|| TemplateError::DuplicateName(template.name.clone()))?;
    tracing::info!(id, name = %template.name, vars = template.variables.len(), "template saved");
    Ok(id)
}

pub fn list_templates(
    store: &dyn DocumentStore,
    query: &TemplateQuery,
) -> Result<Vec<PromptTemplate>> {
    let mut templates: Vec<PromptTemplate> = load_all(store.find(TEMPLATES, &Filter::all())?)?;

    if let Some(needle) = query
        .search
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
    {
        templates.retain(|t| {
            t.name.to_lowercase().contains(&needle)
                || t.description.to_lowercase().contains(&needle)
        });
    }

    match query.sort {
        TemplateSort::Newest => templates.sort_by_key(|t| Reverse((t.created_at, t.id))),
        TemplateSort::NameAsc => templates.sort_by_key(|t| t.name.to_lowercase()),
        TemplateSort::MostUsed => {
            templates.sort_by(|a, b| {
                b.used_count
                    .cmp(&a.used_count)
                    .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            })
        }
    }
    Ok(templates)
}

pub fn get_template(store: &dyn DocumentStore, id: DocId) -> Result<Option<PromptTemplate>> {
    store
        .find_one(TEMPLATES, &Filter::by_id(id))?
        .as_ref()
        .map(load)
        .transpose()
}

/**
 * \brief 更新模板内容与变量声明，重新校验并刷新 `updated_at`。
 */
pub fn update_template(store: &dyn DocumentStore, id: DocId, draft: &TemplateDraft) -> Result<()> {
    let name = checked_name(&draft.name)?;
    validate_template(&draft.template_content, &draft.variables).ensure_savable()?;

    let conflict = same_name(&name);
    let patch = Patch::new()
        .set("name", name.as_str())
        .set("template_content", draft.template_content.as_str())
        .set("variables", serde_json::to_value(&draft.variables)?)
        .set("description", draft.description.as_str())
        .set("updated_at", timestamp(OffsetDateTime::now_utc())?);
    match store.update_one_unless(TEMPLATES, &Filter::by_id(id), &conflict, &patch)? {
        None => return Err(TemplateError::DuplicateName(name).into()),
        Some(false) => return Err(TemplateError::NotFound(id).into()),
        Some(true) => {}
    }
    tracing::info!(id, "template updated");
    Ok(())
}

pub fn delete_template(store: &dyn DocumentStore, id: DocId) -> Result<bool> {
    store.delete_one(TEMPLATES, &Filter::by_id(id))
}

pub fn increment_template_usage(store: &dyn DocumentStore, id: DocId) -> Result<bool> {
    store.update_one(TEMPLATES, &Filter::by_id(id), &Patch::new().inc("used_count", 1))
}

/**
 * \brief 严格渲染已保存模板；成功后才计一次使用。日期变量按声明类型规范化。
 */
pub fn render_saved_template(
    store: &dyn DocumentStore,
    id: DocId,
    values: &HashMap<String, String>,
) -> Result<String> {
    let template = get_template(store, id)?.ok_or(TemplateError::NotFound(id))?;
    let mut normalized = values.clone();
    for spec in &template.variables {
        if let Some(value) = normalized.get_mut(&spec.name) {
            *value = spec.kind.normalize(value);
        }
    }
    let rendered = render_with_policy(
        &template.template_content,
        &template.variables,
        &normalized,
        RenderPolicy::Strict,
    )?;
    increment_template_usage(store, id)?;
    Ok(rendered)
}

/* ---------- 聊天会话 ---------- */

/**
 * \brief 保存会话：已有 id 则整体更新，否则插入并回填 id。
 */
pub fn save_chat_session(store: &dyn DocumentStore, session: &mut ChatSession) -> Result<DocId> {
    session.updated_at = OffsetDateTime::now_utc();
    let body = to_body(&*session)?;
    if let Some(id) = session.id {
        if store.update_one(CHAT_SESSIONS, &Filter::by_id(id), &Patch::new().set_all(body.clone()))? {
            tracing::debug!(id, turns = session.history.len(), "chat session updated");
            return Ok(id);
        }
        tracing::warn!(id, "chat session vanished, saving as new");
    }
    let id = store.insert(CHAT_SESSIONS, body)?;
    session.id = Some(id);
    tracing::info!(id, name = %session.session_name, "chat session saved");
    Ok(id)
}

/**
 * \brief 列出会话，最近更新的在前。
 */
pub fn list_chat_sessions(store: &dyn DocumentStore) -> Result<Vec<ChatSession>> {
    let mut sessions: Vec<ChatSession> = load_all(store.find(CHAT_SESSIONS, &Filter::all())?)?;
    sessions.sort_by_key(|s| Reverse((s.updated_at, s.id)));
    Ok(sessions)
}

pub fn get_chat_session(store: &dyn DocumentStore, id: DocId) -> Result<Option<ChatSession>> {
    store
        .find_one(CHAT_SESSIONS, &Filter::by_id(id))?
        .as_ref()
        .map(load)
        .transpose()
}

pub fn delete_chat_session(store: &dyn DocumentStore, id: DocId) -> Result<bool> {
    store.delete_one(CHAT_SESSIONS, &Filter::by_id(id))
}

/* ---------- 应用设置 ---------- */

fn get_setting(store: &dyn DocumentStore, key: &str) -> Result<Option<Value>> {
    Ok(store
        .find_one(APP_CONFIG, &Filter::all().eq("key", key))?
        .and_then(|doc| doc.body.get("value").cloned()))
}

fn set_setting(store: &dyn DocumentStore, key: &str, value: Value) -> Result<()> {
    let filter = Filter::all().eq("key", key);
    if !store.update_one(APP_CONFIG, &filter, &Patch::new().set("value", value.clone()))? {
        let mut body = serde_json::Map::new();
        body.insert("key".into(), Value::from(key));
        body.insert("value".into(), value);
        store.insert(APP_CONFIG, body)?;
    }
    Ok(())
}

pub fn get_telemetry_enabled(store: &dyn DocumentStore) -> Result<bool> {
    Ok(get_setting(store, TELEMETRY_KEY)?
        .and_then(|v| v.as_bool())
        .unwrap_or(false))
}

pub fn set_telemetry_enabled(store: &dyn DocumentStore, enabled: bool) -> Result<()> {
    set_setting(store, TELEMETRY_KEY, Value::Bool(enabled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{ChatMessage, ProviderName, VariableKind},
        store::SqliteStore,
    };

    fn mem_store() -> SqliteStore {
        SqliteStore::open_in_memory().expect("open in-memory store")
    }

    fn draft(name: &str, content: &str, vars: &[&str]) -> TemplateDraft {
        TemplateDraft {
            name: name.into(),
            template_content: content.into(),
            variables: vars.iter().map(|v| VariableSpec::text(*v)).collect(),
            description: String::new(),
        }
    }

    fn template_error(err: &anyhow::Error) -> Option<&TemplateError> {
        err.downcast_ref::<TemplateError>()
    }

    #[test]
    fn test_prompt_crud_and_usage() {
        let store = mem_store();
        let first = insert_prompt(
            &store,
            " Reviewer ",
            "You review code.",
            &["code".into(), " code".into(), "".into(), "review".into()],
        )
        .expect("insert prompt");
        let second = insert_prompt(&store, "Poet", "You write haiku.", &[]).expect("insert prompt");

        let list = list_prompts(&store).expect("list prompts");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, Some(second));

        let reviewer = get_prompt(&store, first).expect("get").expect("present");
        assert_eq!(reviewer.name, "Reviewer");
        assert_eq!(reviewer.tags, vec!["code", "review"]);
        assert!(reviewer.last_used.is_none());

        assert!(mark_prompt_used(&store, first).expect("mark used"));
        assert!(mark_prompt_used(&store, first).expect("mark used"));
        let reviewer = get_prompt(&store, first).expect("get").expect("present");
        assert_eq!(reviewer.used_count, 2);
        assert!(reviewer.last_used.is_some());

        assert!(update_prompt(&store, first, "Strict reviewer", "Be harsh.", &[]).expect("update"));
        let reviewer = get_prompt(&store, first).expect("get").expect("present");
        assert_eq!(reviewer.content, "Be harsh.");
        assert!(reviewer.tags.is_empty());
        assert_eq!(reviewer.used_count, 2);

        assert!(insert_prompt(&store, "   ", "x", &[]).is_err());
        assert!(delete_prompt(&store, second).expect("delete"));
        assert!(get_prompt(&store, second).expect("get").is_none());
    }

    #[test]
    fn test_template_round_trip_preserves_variable_order() {
        let store = mem_store();
        let mut input = draft(
            "Shipping notice",
            "Hello {name}, your order {order_id} ships on {date}.",
            &["name", "order_id", "date"],
        );
        input.variables[2].kind = VariableKind::Date;
        input.description = "customer mail".into();
        let id = insert_template(&store, &input).expect("insert template");

        let loaded = get_template(&store, id).expect("get").expect("present");
        assert_eq!(loaded.id, Some(id));
        assert_eq!(loaded.template_content, input.template_content);
        let names: Vec<_> = loaded.variables.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["name", "order_id", "date"]);
        assert_eq!(loaded.variables[2].kind, VariableKind::Date);
        assert_eq!(loaded.used_count, 0);
    }

    #[test]
    fn test_template_save_rejections() {
        let store = mem_store();
        insert_template(&store, &draft("Greeting", "Hi {name}", &["name"])).expect("insert");

        let err = insert_template(&store, &draft(" ", "Hi", &[])).unwrap_err();
        assert_eq!(template_error(&err), Some(&TemplateError::EmptyName));

        let err = insert_template(&store, &draft("Greeting", "Yo {name}", &["name"])).unwrap_err();
        assert_eq!(
            template_error(&err),
            Some(&TemplateError::DuplicateName("Greeting".into()))
        );

        let err = insert_template(&store, &draft("Other", "{a} {b}", &["a"])).unwrap_err();
        assert_eq!(
            template_error(&err),
            Some(&TemplateError::UndeclaredVariables(vec!["b".into()]))
        );

        insert_template(&store, &draft("Extra", "{a}", &["a", "unused"]))
            .expect("unused declarations only warn");
    }

    #[test]
    fn test_concurrent_saves_with_same_name_keep_one() {
        let store = std::sync::Arc::new(mem_store());
        let handles: Vec<_> = (0..6)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || {
                    insert_template(store.as_ref(), &draft("Daily", &format!("v{}", i), &[]))
                        .map_err(|err| template_error(&err).cloned())
                })
            })
            .collect();
        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().expect("join")).collect();
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e == &Some(TemplateError::DuplicateName("Daily".into()))));
        let all = list_templates(store.as_ref(), &TemplateQuery::default()).expect("list");
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn test_template_update_revalidates() {
        let store = mem_store();
        let id = insert_template(&store, &draft("One", "{a}", &["a"])).expect("insert");
        insert_template(&store, &draft("Two", "{b}", &["b"])).expect("insert");

        let before = get_template(&store, id).expect("get").expect("present");
        update_template(&store, id, &draft("One", "{a} and {c}", &["a", "c"])).expect("update");
        let after = get_template(&store, id).expect("get").expect("present");
        assert_eq!(after.template_content, "{a} and {c}");
        assert_eq!(after.created_at, before.created_at);
        assert!(after.updated_at >= before.updated_at);

        let err = update_template(&store, id, &draft("Two", "{a}", &["a"])).unwrap_err();
        assert!(matches!(template_error(&err), Some(TemplateError::DuplicateName(_))));

        let err = update_template(&store, id, &draft("One", "{zzz}", &[])).unwrap_err();
        assert!(matches!(
            template_error(&err),
            Some(TemplateError::UndeclaredVariables(_))
        ));

        let err = update_template(&store, 999, &draft("Three", "x", &[])).unwrap_err();
        assert_eq!(template_error(&err), Some(&TemplateError::NotFound(999)));
    }

    #[test]
    fn test_list_templates_search_and_sort() {
        let store = mem_store();
        let a = insert_template(&store, &draft("beta report", "x", &[])).expect("insert");
        let b = insert_template(&store, &draft("Alpha", "y", &[])).expect("insert");
        let mut with_desc = draft("Gamma", "z", &[]);
        with_desc.description = "Weekly REPORT".into();
        let c = insert_template(&store, &with_desc).expect("insert");
        increment_template_usage(&store, b).expect("inc");
        increment_template_usage(&store, b).expect("inc");
        increment_template_usage(&store, c).expect("inc");

        let ids = |query: TemplateQuery| -> Vec<DocId> {
            list_templates(&store, &query)
                .expect("list")
                .into_iter()
                .filter_map(|t| t.id)
                .collect()
        };

        assert_eq!(ids(TemplateQuery::default()), vec![c, b, a]);
        assert_eq!(
            ids(TemplateQuery {
                search: None,
                sort: TemplateSort::NameAsc
            }),
            vec![b, a, c]
        );
        assert_eq!(
            ids(TemplateQuery {
                search: None,
                sort: TemplateSort::MostUsed
            }),
            vec![b, c, a]
        );
        assert_eq!(
            ids(TemplateQuery {
                search: Some("report".into()),
                sort: TemplateSort::NameAsc
            }),
            vec![a, c]
        );
        assert_eq!("most-used".parse::<TemplateSort>(), Ok(TemplateSort::MostUsed));
    }

    #[test]
    fn test_render_saved_template_counts_only_success() {
        let store = mem_store();
        let id = insert_template(
            &store,
            &draft("Notice", "Dear {name}, ref {ref}", &["name", "ref"]),
        )
        .expect("insert");

        let mut values = HashMap::new();
        values.insert("name".to_string(), "Ann".to_string());
        let err = render_saved_template(&store, id, &values).unwrap_err();
        assert_eq!(
            template_error(&err),
            Some(&TemplateError::MissingValues(vec!["ref".into()]))
        );
        assert_eq!(get_template(&store, id).unwrap().unwrap().used_count, 0);

        values.insert("ref".to_string(), "A-17".to_string());
        let out = render_saved_template(&store, id, &values).expect("render");
        assert_eq!(out, "Dear Ann, ref A-17");
        assert_eq!(get_template(&store, id).unwrap().unwrap().used_count, 1);

        let err = render_saved_template(&store, id + 1, &values).unwrap_err();
        assert_eq!(template_error(&err), Some(&TemplateError::NotFound(id + 1)));
    }

    #[test]
    fn test_chat_session_upsert() {
        let store = mem_store();
        let mut session = ChatSession::new(ProviderName::Google, "gemini-2.5-flash", "Be brief.");
        session.history.push(ChatMessage::user("Hi"));
        let id = save_chat_session(&store, &mut session).expect("save");
        assert_eq!(session.id, Some(id));

        session.history.push(ChatMessage::assistant("Hello"));
        session.session_name = "Greetings".into();
        assert_eq!(save_chat_session(&store, &mut session).expect("resave"), id);

        let sessions = list_chat_sessions(&store).expect("list");
        assert_eq!(sessions.len(), 1);
        let loaded = get_chat_session(&store, id).expect("get").expect("present");
        assert_eq!(loaded.session_name, "Greetings");
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.provider, ProviderName::Google);

        assert!(delete_chat_session(&store, id).expect("delete"));
        assert!(list_chat_sessions(&store).expect("list").is_empty());
    }

    #[test]
    fn test_telemetry_flag_persists() {
        let store = mem_store();
        assert!(!get_telemetry_enabled(&store).expect("default"));
        set_telemetry_enabled(&store, true).expect("enable");
        assert!(get_telemetry_enabled(&store).expect("read"));
        set_telemetry_enabled(&store, false).expect("disable");
        assert!(!get_telemetry_enabled(&store).expect("read"));
        assert_eq!(
            store
                .find(APP_CONFIG, &Filter::all())
                .expect("find")
                .len(),
            1
        );
    }
}
