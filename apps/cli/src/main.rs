use std::{
    collections::HashMap,
    io::{Read, Write},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use promptdeck_core_sdk::{
    analysis::{self, AnalysisSettings},
    chat::{self, TurnSettings},
    config::AppConfig,
    db::{self, TemplateDraft, TemplateQuery, TemplateSort},
    llm::{self, ChatProvider},
    models::{ChatSession, ProviderName, VariableKind, VariableSpec},
    server,
    store::{DocId, SqliteStore},
    telemetry, template,
};

/**
 * \brief PromptDeck 命令行入口。
 */
#[derive(Parser, Debug)]
#[command(name = "promptdeck", version, about = "Multi-provider chat, prompt library and templates")]
struct Cli {
    /** \brief 访问组，缺省读取 PROMPTDECK_GROUP。 */
    #[arg(long, global = true)]
    group: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/**
 * \brief 选择厂商与模型；凭据可省略，缺省读取对应环境变量。
 */
#[derive(Args, Debug, Clone)]
struct ProviderArgs {
    #[arg(long, default_value = "OpenAI")]
    provider: String,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,
    #[arg(long)]
    max_tokens: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /** \brief 列出各厂商支持的模型。 */
    Models {
        #[arg(long)]
        provider: Option<String>,
    },

    /** \brief 发送一条消息并流式显示回复，会话自动保存。 */
    Chat {
        #[command(flatten)]
        provider: ProviderArgs,
        /** \brief 继续已有会话。 */
        #[arg(long)]
        session: Option<DocId>,
        #[arg(long)]
        system: Option<String>,
        /** \brief 以提示词库中的条目作为系统指令。 */
        #[arg(long, conflicts_with = "system")]
        prompt_id: Option<DocId>,
        message: String,
    },

    /** \brief 系统提示词库。 */
    #[command(subcommand)]
    Prompt(PromptCommand),

    /** \brief 变量模板。 */
    #[command(subcommand)]
    Template(TemplateCommand),

    /** \brief 已保存的聊天会话。 */
    #[command(subcommand)]
    Sessions(SessionCommand),

    /** \brief 对一段文本并发执行翻译、摘要与词汇提取。 */
    Analyze {
        #[command(flatten)]
        provider: ProviderArgs,
        #[arg(long, default_value = "English")]
        language: String,
        /** \brief 以 JSON 输出结果。 */
        #[arg(long)]
        json: bool,
        /** \brief 输入文本，`-` 表示从标准输入读取。 */
        text: String,
    },

    /** \brief 查看或修改设置。 */
    Config {
        #[arg(long)]
        telemetry: Option<bool>,
    },

    /** \brief 启动本地 HTTP 服务并提供前端页面。 */
    Serve {
        #[arg(long)]
        addr: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum PromptCommand {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        content: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    List,
    Update {
        id: DocId,
        #[arg(long)]
        name: String,
        #[arg(long)]
        content: String,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
    Delete {
        id: DocId,
    },
}

#[derive(Subcommand, Debug)]
enum TemplateCommand {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        content: String,
        /** \brief 变量声明 `name[:type[:description]]`，省略时从内容推断。 */
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<VariableSpec>,
        #[arg(long, default_value = "")]
        description: String,
    },
    List {
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value = "newest")]
        sort: TemplateSort,
    },
    Show {
        id: DocId,
    },
    /** \brief 不保存，只检查内容与声明是否一致。 */
    Inspect {
        #[arg(long)]
        content: String,
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<VariableSpec>,
    },
    Render {
        id: DocId,
        /** \brief 变量取值 `key=value`。 */
        #[arg(long = "set", value_parser = parse_pair)]
        values: Vec<(String, String)>,
    },
    Delete {
        id: DocId,
    },
}

#[derive(Subcommand, Debug)]
enum SessionCommand {
    List,
    Show { id: DocId },
    Delete { id: DocId },
}

fn parse_var(raw: &str) -> Result<VariableSpec, String> {
    let mut parts = raw.splitn(3, ':');
    let name = parts.next().unwrap_or_default().trim();
    if name.is_empty() {
        return Err("variable name must not be empty".into());
    }
    let kind = match parts.next() {
        Some(kind) if !kind.trim().is_empty() => kind.parse::<VariableKind>()?,
        _ => VariableKind::Text,
    };
    Ok(VariableSpec {
        name: name.to_string(),
        kind,
        description: parts.next().unwrap_or_default().trim().to_string(),
    })
}

fn parse_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))?;
    Ok((key.trim().to_string(), value.to_string()))
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

fn build_provider(
    config: &AppConfig,
    args: &ProviderArgs,
) -> Result<(llm::LlmProvider, String)> {
    let chosen =
        config.provider_config(&args.provider, args.model.as_deref(), args.api_key.as_deref())?;
    let provider = llm::provider_for(&chosen, &config.client_options(chosen.provider_name))?;
    Ok((provider, chosen.model))
}

fn print_template_line(t: &promptdeck_core_sdk::models::PromptTemplate) {
    println!(
        "[{}] {} (vars: {}; used {}x){}",
        t.id.unwrap_or_default(),
        t.name,
        t.variables
            .iter()
            .map(|v| v.name.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        t.used_count,
        if t.description.is_empty() {
            String::new()
        } else {
            format!(" - {}", t.description)
        }
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::from_env().context("load configuration failed")?;
    tracing::debug!(?config, "configuration loaded");

    if let Commands::Serve { addr } = cli.command {
        let mut config = config;
        if let Some(addr) = addr {
            config.addr = addr;
        }
        return server::run(config).await;
    }

    let group = config.group_or_default(cli.group.as_deref())?;
    let store = SqliteStore::open(config.store_path(&group)).context("open database failed")?;
    telemetry::set_log_dir(config.log_dir.clone());
    telemetry::set_enabled(db::get_telemetry_enabled(&store).unwrap_or(false));

    match cli.command {
        Commands::Models { provider } => {
            let providers = match provider {
                Some(name) => vec![name.parse::<ProviderName>()?],
                None => ProviderName::ALL.to_vec(),
            };
            for p in providers {
                println!("{}:", p);
                for model in llm::models_for(p) {
                    println!("  {}", model);
                }
            }
        }
        Commands::Chat {
            provider: args,
            session,
            system,
            prompt_id,
            message,
        } => {
            let (provider, model) = build_provider(&config, &args)?;
            let mut session = match session {
                Some(id) => db::get_chat_session(&store, id)?
                    .ok_or_else(|| anyhow!("session {} not found", id))?,
                None => ChatSession::new(provider.name(), model.clone(), ""),
            };
            session.provider = provider.name();
            session.model = model;
            if let Some(id) = prompt_id {
                let prompt = db::get_prompt(&store, id)?
                    .ok_or_else(|| anyhow!("prompt {} not found", id))?;
                session.system_prompt = prompt.content;
                db::mark_prompt_used(&store, id)?;
            } else if let Some(system) = system {
                session.system_prompt = system;
            }

            telemetry::log_event(
                "cli.chat",
                &format!(
                    "provider={} model={} prompt_len={}",
                    session.provider,
                    session.model,
                    message.len()
                ),
            );
            let settings = TurnSettings {
                temperature: args.temperature,
                max_tokens: args.max_tokens,
            };
            let outcome = chat::run_turn(&provider, &mut session, &message, settings, |chunk| {
                print!("{}", chunk);
                std::io::stdout().flush().ok();
            })
            .await?;
            println!();

            let id = db::save_chat_session(&store, &mut session).context("save session failed")?;
            eprintln!("session id={} ({})", id, session.session_name);
            if let Some(err) = outcome.failure {
                telemetry::log_error("cli.chat", &format!("stream error: {}", err));
                bail!("stream interrupted: {}", err);
            }
        }
        Commands::Prompt(cmd) => match cmd {
            PromptCommand::Add {
                name,
                content,
                tags,
            } => {
                let id = db::insert_prompt(&store, &name, &content, &tags)?;
                println!("Saved prompt id={}", id);
            }
            PromptCommand::List => {
                for p in db::list_prompts(&store)? {
                    println!(
                        "[{}] {} [{}] used {}x",
                        p.id.unwrap_or_default(),
                        p.name,
                        p.tags.join(", "),
                        p.used_count
                    );
                }
            }
            PromptCommand::Update {
                id,
                name,
                content,
                tags,
            } => {
                if !db::update_prompt(&store, id, &name, &content, &tags)? {
                    bail!("prompt {} not found", id);
                }
                println!("Updated prompt id={}", id);
            }
            PromptCommand::Delete { id } => {
                if !db::delete_prompt(&store, id)? {
                    bail!("prompt {} not found", id);
                }
                println!("Deleted prompt id={}", id);
            }
        },
        Commands::Template(cmd) => match cmd {
            TemplateCommand::Add {
                name,
                content,
                vars,
                description,
            } => {
                let variables = if vars.is_empty() {
                    template::infer_variable_specs(&content, &[])
                } else {
                    vars
                };
                let draft = TemplateDraft {
                    name,
                    template_content: content,
                    variables,
                    description,
                };
                let id = db::insert_template(&store, &draft)?;
                println!("Saved template id={}", id);
            }
            TemplateCommand::List { search, sort } => {
                let query = TemplateQuery { search, sort };
                for t in db::list_templates(&store, &query)? {
                    print_template_line(&t);
                }
            }
            TemplateCommand::Show { id } => {
                let t = db::get_template(&store, id)?
                    .ok_or_else(|| anyhow!("template {} not found", id))?;
                print_template_line(&t);
                for v in &t.variables {
                    println!("  {{{}}} : {:?} {}", v.name, v.kind, v.description);
                }
                println!("{}", t.template_content);
            }
            TemplateCommand::Inspect { content, vars } => {
                let report = template::validate_template(&content, &vars);
                println!("variables: {}", template::extract_variables(&content).join(", "));
                if !report.missing.is_empty() {
                    println!("undeclared: {}", report.missing.join(", "));
                }
                if !report.extra.is_empty() {
                    println!("unused: {}", report.extra.join(", "));
                }
                if report.is_clean() {
                    println!("ok");
                }
            }
            TemplateCommand::Render { id, values } => {
                let values: HashMap<String, String> = values.into_iter().collect();
                println!("{}", db::render_saved_template(&store, id, &values)?);
            }
            TemplateCommand::Delete { id } => {
                if !db::delete_template(&store, id)? {
                    bail!("template {} not found", id);
                }
                println!("Deleted template id={}", id);
            }
        },
        Commands::Sessions(cmd) => match cmd {
            SessionCommand::List => {
                for s in db::list_chat_sessions(&store)? {
                    println!(
                        "[{}] {} ({} / {}, {} messages)",
                        s.id.unwrap_or_default(),
                        s.session_name,
                        s.provider,
                        s.model,
                        s.history.len()
                    );
                }
            }
            SessionCommand::Show { id } => {
                let s = db::get_chat_session(&store, id)?
                    .ok_or_else(|| anyhow!("session {} not found", id))?;
                println!("{} ({} / {})", s.session_name, s.provider, s.model);
                if !s.system_prompt.is_empty() {
                    println!("system: {}", s.system_prompt);
                }
                for m in &s.history {
                    println!("{}: {}", m.role.as_str(), m.content);
                }
            }
            SessionCommand::Delete { id } => {
                if !db::delete_chat_session(&store, id)? {
                    bail!("session {} not found", id);
                }
                println!("Deleted session id={}", id);
            }
        },
        Commands::Analyze {
            provider: args,
            language,
            json,
            text,
        } => {
            let text = if text == "-" {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("read stdin failed")?;
                buf
            } else {
                text
            };
            let (provider, model) = build_provider(&config, &args)?;
            let mut settings = AnalysisSettings::new(model);
            settings.temperature = args.temperature;
            settings.max_tokens = args.max_tokens;
            let provider: Arc<dyn ChatProvider> = Arc::new(provider);
            let results = analysis::run_analysis(
                provider,
                &settings,
                &text,
                &analysis::default_tasks(&language),
            )
            .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                for result in results {
                    println!("== {} ==\n{}\n", result.task, result.output);
                }
            }
        }
        Commands::Config { telemetry: flag } => {
            if let Some(enabled) = flag {
                db::set_telemetry_enabled(&store, enabled)?;
                telemetry::set_enabled(enabled);
            }
            println!(
                "group={} telemetry={} log_dir={}",
                group,
                telemetry::is_enabled(),
                config.log_dir.display()
            );
            for p in ProviderName::ALL {
                println!(
                    "{} key: {}",
                    p,
                    if config.api_key_for(p).is_some() {
                        "set"
                    } else {
                        "missing"
                    }
                );
            }
        }
        Commands::Serve { .. } => unreachable!("handled above"),
    }

    Ok(())
}
