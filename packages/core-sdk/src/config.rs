use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context, Result};

use crate::{
    error::LlmError,
    llm::{models_for, ClientOptions},
    models::{ProviderConfig, ProviderName},
};

const DEFAULT_DATA_DIR: &str = "data";
const DEFAULT_GROUP: &str = "default";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_READ_TIMEOUT_SECS: u64 = 120;
const DEFAULT_ADDR: &str = "127.0.0.1:5173";
const DEFAULT_UI_DIR: &str = "web";
const DEFAULT_LOG_DIR: &str = "logs";

/** \brief 厂商地址覆盖变量，例如 `PROMPTDECK_OPENAI_BASE_URL`。 */
pub fn base_url_var(provider: ProviderName) -> String {
    format!("PROMPTDECK_{}_BASE_URL", provider.as_str().to_ascii_uppercase())
}

/**
 * \brief 访问组名：只允许字母、数字、`-` 与 `_`，每个组对应一个独立的数据文件。
 */
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessGroup(String);

impl AccessGroup {
    pub fn new(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            bail!("access group must not be empty");
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!("access group `{}` may only contain letters, digits, `-` and `_`", name);
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for AccessGroup {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for AccessGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/**
 * \brief 运行配置，来自环境变量（以及可选的 `.env` 文件）。
 */
#[derive(Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub default_group: AccessGroup,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub addr: String,
    pub ui_dir: PathBuf,
    /** \brief 遥测日志目录。 */
    pub log_dir: PathBuf,
    /** \brief 按厂商覆盖默认接口地址（代理或本地桩服务）。 */
    pub base_urls: HashMap<ProviderName, String>,
    api_keys: HashMap<ProviderName, String>,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut configured: Vec<&str> = self.api_keys.keys().map(|p| p.as_str()).collect();
        configured.sort_unstable();
        f.debug_struct("AppConfig")
            .field("data_dir", &self.data_dir)
            .field("default_group", &self.default_group)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("addr", &self.addr)
            .field("ui_dir", &self.ui_dir)
            .field("log_dir", &self.log_dir)
            .field("base_urls", &self.base_urls)
            .field("api_keys", &configured)
            .finish()
    }
}

impl AppConfig {
    /**
     * \brief 先加载 `.env`（不存在则忽略），再读取进程环境。
     */
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /**
     * \brief 用任意键值来源构建配置，便于测试。
     */
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: u64| -> Result<Duration> {
            match var(key) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{} must be a whole number of seconds", key)),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let default_group = AccessGroup::new(
            &var("PROMPTDECK_GROUP").unwrap_or_else(|| DEFAULT_GROUP.to_string()),
        )
        .context("PROMPTDECK_GROUP")?;

        let mut api_keys = HashMap::new();
        let mut base_urls = HashMap::new();
        for provider in ProviderName::ALL {
            if let Some(key) = provider.key_env_vars().iter().find_map(|&name| var(name)) {
                api_keys.insert(provider, key.trim().to_string());
            }
            if let Some(url) = var(&base_url_var(provider)) {
                base_urls.insert(provider, url.trim().to_string());
            }
        }

        Ok(Self {
            data_dir: PathBuf::from(
                var("PROMPTDECK_DATA_DIR").unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()),
            ),
            default_group,
            connect_timeout: secs("PROMPTDECK_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
            read_timeout: secs("PROMPTDECK_READ_TIMEOUT_SECS", DEFAULT_READ_TIMEOUT_SECS)?,
            addr: var("PROMPTDECK_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string()),
            ui_dir: PathBuf::from(
                var("PROMPTDECK_UI_DIR").unwrap_or_else(|| DEFAULT_UI_DIR.to_string()),
            ),
            log_dir: PathBuf::from(
                var("PROMPTDECK_LOG_DIR").unwrap_or_else(|| DEFAULT_LOG_DIR.to_string()),
            ),
            base_urls,
            api_keys,
        })
    }

    /** \brief 访问组对应的数据文件路径。 */
    pub fn store_path(&self, group: &AccessGroup) -> PathBuf {
        self.data_dir.join(format!("{}.db", group.as_str()))
    }

    /** \brief `None` 时使用默认组。 */
    pub fn group_or_default(&self, group: Option<&str>) -> Result<AccessGroup> {
        match group {
            Some(name) => AccessGroup::new(name),
            None => Ok(self.default_group.clone()),
        }
    }

    pub fn client_options(&self, provider: ProviderName) -> ClientOptions {
        ClientOptions {
            connect_timeout: Some(self.connect_timeout),
            read_timeout: Some(self.read_timeout),
            base_url: self.base_urls.get(&provider).cloned(),
        }
    }

    pub fn api_key_for(&self, provider: ProviderName) -> Option<&str> {
        self.api_keys.get(&provider).map(String::as_str)
    }

    /**
     * \brief 显式传入的凭据优先，其次为环境变量。
     */
    pub fn resolve_api_key(
        &self,
        provider: ProviderName,
        explicit: Option<&str>,
    ) -> Result<String, LlmError> {
        explicit
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key_for(provider))
            .map(str::to_string)
            .ok_or(LlmError::MissingCredential(provider))
    }

    /**
     * \brief 由用户选择组装本次会话的 Provider 配置。
     * \details 未给模型时取该厂商列表中的第一个；名称或凭据无效返回配置类错误。
     */
    pub fn provider_config(
        &self,
        provider: &str,
        model: Option<&str>,
        explicit_key: Option<&str>,
    ) -> Result<ProviderConfig, LlmError> {
        let provider_name: ProviderName = provider.parse()?;
        let api_key = self.resolve_api_key(provider_name, explicit_key)?;
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or_else(|| models_for(provider_name).first().copied())
            .map(str::to_string)
            .ok_or_else(|| {
                LlmError::InvalidRequest(format!("{} has no default model", provider_name))
            })?;
        Ok(ProviderConfig {
            provider_name,
            api_key,
            model,
        })
    }
}
