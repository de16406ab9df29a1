use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::TryRecvError;

use panelchat_core_sdk::{
    config::Config,
    db,
    format::{tokenize, Span},
    llm::{GeminiClient, GenerativeApi},
    models::TurnId,
    panel::{Author, ChatPanel, RenderedEntry, SendAttempt},
    router::MessageRouter,
    server::{self, AppState},
    settings::{SettingsPanel, Status},
    telemetry,
};

/**
 * \brief CLI 程序入口：终端上的聊天面板与设置页。
 */
#[derive(Parser, Debug)]
#[command(name = "panelchat", version, about = "PanelChat: Gemini chat from the terminal")]
struct Cli {
    /** \brief 覆盖数据库路径（默认读取 PANELCHAT_DB） */
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /** \brief 覆盖模型名（默认读取 PANELCHAT_MODEL） */
    #[arg(long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 管理 API Key。
     */
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /**
     * \brief 进入交互式聊天面板。
     */
    Chat,

    /**
     * \brief 发送一条消息并打印回复。
     */
    Send {
        #[arg(long)]
        prompt: String,
    },

    /**
     * \brief 打印已保存的对话历史。
     */
    History,

    /**
     * \brief 清空对话历史。
     */
    Clear {
        #[arg(long, default_value_t = false)]
        yes: bool,
    },

    /**
     * \brief 开关本地遥测日志。
     */
    Telemetry { state: Switch },

    /**
     * \brief 以 HTTP/SSE 服务形式运行后台路由。
     */
    Serve {
        #[arg(long, default_value = "127.0.0.1:5174")]
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum KeyAction {
    /** \brief 校验并保存 */
    Set { api_key: String },
    /** \brief 删除已保存的密钥 */
    Clear,
    /** \brief 显示已保存的密钥（默认遮挡） */
    Show {
        #[arg(long, default_value_t = false)]
        reveal: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Switch {
    On,
    Off,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    if let Some(path) = cli.db {
        config.db_path = path;
    }
    if let Some(model) = cli.model {
        config.model = model;
    }

    telemetry::set_log_dir(&config.log_dir);
    let conn = db::open_shared(&config.db_path).context("open database failed")?;
    let telemetry_enabled = db::with_conn(&conn, db::get_telemetry_enabled).unwrap_or(false);
    telemetry::set_enabled(telemetry_enabled);

    let api: Arc<dyn GenerativeApi> = Arc::new(GeminiClient::from_config(&config));

    match cli.command {
        Commands::Key { action } => {
            let mut settings = SettingsPanel::new(conn.clone(), api.clone());
            match action {
                KeyAction::Set { api_key } => report(settings.save(&api_key).await)?,
                KeyAction::Clear => report(settings.clear())?,
                KeyAction::Show { reveal } => {
                    if reveal {
                        settings.toggle_visibility();
                    }
                    match settings.load().context("load api key failed")? {
                        Some(key) => println!("{}", settings.display_key(&key)),
                        None => println!("(no API key saved)"),
                    }
                }
            }
        }
        Commands::Chat => {
            let router = MessageRouter::new(conn.clone(), api.clone());
            run_chat(&router).await?;
        }
        Commands::Send { prompt } => {
            let prompt = prompt.trim();
            if prompt.is_empty() {
                bail!("prompt must not be empty");
            }
            let router = MessageRouter::new(conn.clone(), api.clone());
            let outcome = router.submit(TurnId::new(), prompt).await;
            match outcome.result {
                Ok(text) => {
                    let spans: Vec<Span<'_>> = tokenize(&text).collect();
                    println!("{}", render_spans(&spans));
                }
                Err(e) => bail!("{}", e.user_message()),
            }
        }
        Commands::History => {
            let history = db::with_conn(&conn, db::load_history).context("load history failed")?;
            if history.is_empty() {
                println!("(no messages)");
            }
            for message in history.entries() {
                println!("{}: {}", message.role.api_label(), message.content);
            }
        }
        Commands::Clear { yes } => {
            if yes || confirm("Are you sure you want to clear the chat history?")? {
                let router = MessageRouter::new(conn.clone(), api.clone());
                router.clear().context("clear history failed")?;
                println!("Chat history cleared");
            }
        }
        Commands::Telemetry { state } => {
            let enabled = matches!(state, Switch::On);
            db::with_conn(&conn, |c| db::set_telemetry_enabled(c, enabled))
                .context("save telemetry failed")?;
            telemetry::set_enabled(enabled);
            println!("Telemetry {}", if enabled { "enabled" } else { "disabled" });
        }
        Commands::Serve { addr } => {
            server::run(&addr, AppState::new(conn.clone(), api.clone())).await?;
        }
    }

    Ok(())
}

/**
 * \brief 交互式面板循环：读取输入 → 交给路由 → 应用推送事件 → 渲染。
 */
async fn run_chat(router: &MessageRouter) -> Result<()> {
    let mut panel = ChatPanel::new();
    let mut events = router.subscribe();
    panel.load(&router.history()?, router.has_credential()?);
    let mut shown = render_from(&panel, 0);

    println!("Type a message and press Enter. /clear clears the chat, /quit exits.");
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush().ok();
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }

        match line.trim() {
            "/quit" | "/exit" => break,
            "/clear" => {
                let confirmed = confirm("Are you sure you want to clear the chat history?")?;
                if let Some(request) = panel.request_clear(confirmed) {
                    router.handle(request).await;
                    shown = 0;
                    println!("(chat cleared)");
                }
            }
            input => match panel.begin_send(input, router.has_credential()?) {
                SendAttempt::Ignored => {}
                SendAttempt::MissingCredential => {
                    shown = render_from(&panel, shown);
                }
                SendAttempt::Send(request) => {
                    // 用户输入已在终端回显，不再重复打印
                    shown = panel.transcript().len();
                    if panel.typing_indicator() {
                        eprintln!("…");
                    }
                    router.handle(request).await;
                    loop {
                        match events.try_recv() {
                            Ok(event) => {
                                panel.apply(&event);
                            }
                            Err(TryRecvError::Lagged(_)) => continue,
                            Err(_) => break,
                        }
                    }
                    shown = render_from(&panel, shown);
                }
            },
        }
    }
    Ok(())
}

fn render_from(panel: &ChatPanel, from: usize) -> usize {
    let transcript = panel.transcript();
    for entry in transcript.iter().skip(from) {
        render_entry(entry);
    }
    transcript.len()
}

fn render_entry(entry: &RenderedEntry) {
    let label = match entry.author {
        Author::User => "you",
        Author::Model => "gemini",
        Author::Error => "error",
    };
    println!("[{}] {}:", entry.timestamp(), label);
    println!("{}", render_spans(&entry.spans()));
}

fn render_spans(spans: &[Span<'_>]) -> String {
    let mut out = String::new();
    for span in spans {
        match span {
            Span::Text { text } => out.push_str(text),
            Span::Link { url } => {
                out.push('<');
                out.push_str(url);
                out.push('>');
            }
            Span::InlineCode { code } => {
                out.push('`');
                out.push_str(code);
                out.push('`');
            }
            Span::CodeBlock { lang, code } => {
                out.push_str(&format!("\n--- {} ---\n", lang.unwrap_or("code")));
                for line in code.lines() {
                    out.push_str("    ");
                    out.push_str(line);
                    out.push('\n');
                }
                out.push_str("---");
            }
        }
    }
    out
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush().ok();
    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn report(status: Status) -> Result<()> {
    if status.is_error() {
        bail!("{}", status.message);
    }
    println!("{}", status.message);
    Ok(())
}
