use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::{error::TemplateError, models::VariableSpec};

/** \brief `{name}`：一对花括号包裹的非花括号字符序列，无转义机制。 */
static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([^{}]+)\}").expect("placeholder pattern is valid"));

/**
 * \brief 未填写变量的处理策略。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderPolicy {
    /** \brief 保留字面量 `{name}`，让不完整的结果一眼可见。 */
    #[default]
    Lenient,
    /** \brief 任一声明变量缺值即拒绝渲染。 */
    Strict,
}

/**
 * \brief 模板校验结果；两者都只是建议，由调用方决定是否阻断保存。
 */
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /** \brief 模板引用但未声明的变量。 */
    pub missing: Vec<String>,
    /** \brief 声明但模板未引用的变量。 */
    pub extra: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }

    /**
     * \brief 保存前检查：缺失声明阻断，多余声明仅告警。
     */
    pub fn ensure_savable(&self) -> Result<(), TemplateError> {
        if !self.extra.is_empty() {
            tracing::warn!(extra = ?self.extra, "template declares unused variables");
        }
        if self.missing.is_empty() {
            Ok(())
        } else {
            Err(TemplateError::UndeclaredVariables(self.missing.clone()))
        }
    }
}

/**
 * \brief 提取模板中的变量名，去重并保持首次出现顺序。
 */
pub fn extract_variables(template: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    PLACEHOLDER
        .captures_iter(template)
        .filter_map(|caps| {
            let name = caps[1].to_string();
            seen.insert(name.clone()).then_some(name)
        })
        .collect()
}

/**
 * \brief 用给定取值替换所有 `{name}`。
 * \details 单次扫描：已替换的值不会被再次解析；模板里没有的键被忽略；
 *          没有取值的占位符原样保留。
 */
pub fn render_template<I, K, V>(template: &str, values: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    let values: HashMap<String, String> = values
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect();
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match values.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/**
 * \brief 对比模板引用的变量与声明的变量。
 */
pub fn validate_template(template: &str, variables: &[VariableSpec]) -> ValidationReport {
    let referenced = extract_variables(template);
    let declared: Vec<&str> = variables.iter().map(|v| v.name.as_str()).collect();

    let missing = referenced
        .iter()
        .filter(|name| !declared.contains(&name.as_str()))
        .cloned()
        .collect();
    let mut seen = HashSet::new();
    let extra = declared
        .iter()
        .copied()
        .filter(|name| !referenced.iter().any(|r| r == name) && seen.insert(*name))
        .map(str::to_string)
        .collect();

    ValidationReport { missing, extra }
}

/**
 * \brief 按策略渲染。`Strict` 下空白值同样视为缺失，并列出全部缺失变量。
 */
pub fn render_with_policy(
    template: &str,
    variables: &[VariableSpec],
    values: &HashMap<String, String>,
    policy: RenderPolicy,
) -> Result<String, TemplateError> {
    if policy == RenderPolicy::Strict {
        let missing: Vec<String> = variables
            .iter()
            .filter(|spec| {
                values
                    .get(&spec.name)
                    .map(|v| v.trim().is_empty())
                    .unwrap_or(true)
            })
            .map(|spec| spec.name.clone())
            .collect();
        if !missing.is_empty() {
            return Err(TemplateError::MissingValues(missing));
        }
    }
    Ok(render_template(
        template,
        values.iter().map(|(k, v)| (k.as_str(), v.as_str())),
    ))
}

/**
 * \brief 根据模板内容生成变量声明，沿用已有声明的类型与描述。
 */
pub fn infer_variable_specs(template: &str, existing: &[VariableSpec]) -> Vec<VariableSpec> {
    extract_variables(template)
        .into_iter()
        .map(|name| {
            existing
                .iter()
                .find(|spec| spec.name == name)
                .cloned()
                .unwrap_or_else(|| VariableSpec::text(name))
        })
        .collect()
}
