use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::{
    chat::collect_reply,
    error::LlmError,
    llm::{safety_advisory, ChatProvider},
    models::{ChatMessage, ChatRequest},
    template::render_template,
};

/** \brief 同时进行的分析任务上限。 */
pub const ANALYSIS_POOL_SIZE: usize = 3;

/** \brief 任务模板中代表输入文本的变量名。 */
pub const TEXT_VARIABLE: &str = "text";

/**
 * \brief 一个分析任务：模板里的 `{text}` 会被替换为输入文本。
 */
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisTask {
    pub name: String,
    pub prompt_template: String,
    #[serde(default)]
    pub system_prompt: String,
}

impl AnalysisTask {
    fn expert(name: &str, prompt_template: String) -> Self {
        Self {
            name: name.to_string(),
            system_prompt: format!("你是一名{}专家，请准确而细致地完成任务。", name),
            prompt_template,
        }
    }
}

/**
 * \brief 默认的三项任务：翻译、摘要、词汇提取。
 */
pub fn default_tasks(target_language: &str) -> Vec<AnalysisTask> {
    vec![
        AnalysisTask::expert(
            "翻译",
            format!(
                "请把下面的文本翻译成{}，保持原文的含义与风格，只返回译文，不要附加解释：\n\n{{text}}",
                target_language
            ),
        ),
        AnalysisTask::expert(
            "摘要",
            format!(
                "请用{}把下面的文本概括为 3-5 句要点，聚焦最重要的信息：\n\n{{text}}",
                target_language
            ),
        ),
        AnalysisTask::expert(
            "词汇提取",
            format!(
                "从下面的文本中挑出 5-10 个最实用的词或短语，每个给出：\n- 原词\n- 读音（如有需要）\n- {}释义\n- 用法示例\n\n文本：\n{{text}}",
                target_language
            ),
        ),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    Completed,
    Empty,
    Blocked,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub task: String,
    pub status: AnalysisStatus,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalysisSettings {
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

impl AnalysisSettings {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

async fn run_task(
    provider: &dyn ChatProvider,
    settings: &AnalysisSettings,
    task: &AnalysisTask,
    input_text: &str,
) -> AnalysisResult {
    let prompt = render_template(&task.prompt_template, [(TEXT_VARIABLE, input_text)]);
    let request = ChatRequest::new(settings.model.clone(), vec![ChatMessage::user(prompt)])
        .with_system_prompt(task.system_prompt.clone())
        .with_temperature(settings.temperature)
        .with_max_tokens(settings.max_tokens);

    let reply = match provider.chat_stream(request) {
        Ok(stream) => collect_reply(stream).await,
        Err(err) => Err(err),
    };
    let (status, output) = match reply {
        Ok(text) if text.trim().is_empty() => (
            AnalysisStatus::Empty,
            format!("⚠️ 没有收到「{}」的回复，请尝试切换其他模型。", task.name),
        ),
        Ok(text) if text.trim_end().ends_with(&safety_advisory(provider.name())) => {
            (AnalysisStatus::Blocked, text.trim().to_string())
        }
        Ok(text) => (AnalysisStatus::Completed, text.trim().to_string()),
        Err(err) => {
            tracing::warn!(task = %task.name, error = %err, "analysis task failed");
            (
                AnalysisStatus::Failed,
                format!("❌ 「{}」处理失败：{}", task.name, err),
            )
        }
    };
    AnalysisResult {
        task: task.name.clone(),
        status,
        output,
    }
}

/**
 * \brief 并发执行全部任务（最多 `ANALYSIS_POOL_SIZE` 个同时进行），等待全部完成后按任务顺序返回。
 * \details 单个任务失败不会影响其他任务，失败以结果文本体现。
 */
pub async fn run_analysis(
    provider: Arc<dyn ChatProvider>,
    settings: &AnalysisSettings,
    input_text: &str,
    tasks: &[AnalysisTask],
) -> Result<Vec<AnalysisResult>, LlmError> {
    if input_text.trim().is_empty() {
        return Err(LlmError::InvalidRequest(
            "input text must not be empty".into(),
        ));
    }
    tracing::info!(tasks = tasks.len(), chars = input_text.len(), model = %settings.model, "analysis started");

    let permits = Arc::new(Semaphore::new(ANALYSIS_POOL_SIZE));
    let handles: Vec<_> = tasks
        .iter()
        .cloned()
        .map(|task| {
            let provider = Arc::clone(&provider);
            let permits = Arc::clone(&permits);
            let settings = settings.clone();
            let input = input_text.to_string();
            tokio::spawn(async move {
                let _permit = permits.acquire_owned().await;
                run_task(provider.as_ref(), &settings, &task, &input).await
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (handle, task) in handles.into_iter().zip(tasks) {
        let result = handle.await.unwrap_or_else(|err| AnalysisResult {
            task: task.name.clone(),
            status: AnalysisStatus::Failed,
            output: format!("❌ 「{}」处理失败：{}", task.name, err),
        });
        results.push(result);
    }
    Ok(results)
}
