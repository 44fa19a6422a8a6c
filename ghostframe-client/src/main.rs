use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    process::ExitCode,
    sync::{Arc, Mutex},
};

use clap::Parser;
use ghostframe_client::{
    ApiClient, BackendCommand, BackendSupervisor, EventChannel, FileTransfer, SyncEngine,
    SyncUpdate,
    config::{
        ClientSettings, SavedClientConfig, config_path, load_config_from_path, log_path,
        save_config_with_retry,
    },
};
use ghostframe_core::{BackendEndpoint, ChatEvent, Message, MessageBody, Sender};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "ghostframe")]
struct ClientArgs {
    /// Packaged backend executable.
    #[arg(long, conflicts_with_all = ["interpreter", "script"])]
    backend_bin: Option<PathBuf>,
    /// Interpreter for a development backend script.
    #[arg(long, requires = "script")]
    interpreter: Option<PathBuf>,
    #[arg(long, requires = "interpreter")]
    script: Option<PathBuf>,
    /// Extra argument passed to the backend; repeatable.
    #[arg(long = "backend-arg", allow_hyphen_values = true)]
    backend_args: Vec<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Persist the given flags as the new defaults.
    #[arg(long, default_value_t = false)]
    save_config: bool,
}

impl ClientArgs {
    fn as_overrides(&self) -> SavedClientConfig {
        let backend = match (&self.backend_bin, &self.interpreter, &self.script) {
            (Some(binary), _, _) => Some(BackendCommand::Packaged {
                binary: binary.clone(),
            }),
            (None, Some(interpreter), Some(script)) => Some(BackendCommand::Dev {
                interpreter: interpreter.clone(),
                script: script.clone(),
            }),
            _ => None,
        };
        SavedClientConfig {
            display_name: self.name.clone(),
            backend,
            backend_args: self.backend_args.clone(),
            download_dir: self.download_dir.clone(),
        }
    }
}

enum Flow {
    Continue,
    Quit,
}

const HELP: &str = "commands:
  ls                      list peers
  open <peer>             load and show history
  msg <peer> <text>       send a message
  share <peer> <path>     share a file
  get <file-id> [name]    download a shared file
  login <name>            start a new session
  logout                  end the session
  quit";

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let args = ClientArgs::parse();

    let path = config_path();
    let saved = match load_config_from_path(&path) {
        Ok(saved) => saved.unwrap_or_default(),
        Err(err) => {
            warn!("saved config invalid; ignoring {}: {}", path.display(), err);
            SavedClientConfig::default()
        }
    };
    let overrides = args.as_overrides();
    if args.save_config {
        let to_save = saved.clone().merged_with(overrides.clone());
        let save_path = path.clone();
        match tokio::task::spawn_blocking(move || save_config_with_retry(&save_path, &to_save))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("failed to save config {}: {}", path.display(), err),
            Err(err) => warn!("config save task failed: {}", err),
        }
    }

    let settings = match ClientSettings::resolve(saved.merged_with(overrides)) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    info!(backend = %settings.backend.describe(), "client starting");

    let mut supervisor =
        BackendSupervisor::new(settings.backend.clone()).with_args(settings.backend_args.clone());
    let endpoint = match supervisor.start().await {
        Ok(endpoint) => endpoint,
        Err(err) => {
            error!("backend startup failed: {}", err);
            eprintln!("{}", err.user_message());
            return ExitCode::FAILURE;
        }
    };

    let result = run_client(endpoint, &settings).await;
    supervisor.stop().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("client stopped: {}", err);
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_client(endpoint: BackendEndpoint, settings: &ClientSettings) -> Result<(), String> {
    let api = ApiClient::new(endpoint).map_err(|err| err.to_string())?;
    let transfer = FileTransfer::new(api.clone());
    let mut engine = SyncEngine::new(api);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let name = match settings.display_name.clone() {
        Some(name) => name,
        None => {
            prompt("name> ");
            match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(()),
                Err(err) => return Err(format!("failed to read stdin: {err}")),
            }
        }
    };

    let (opened, queue) = start_session(&mut engine, endpoint, &name).await?;
    let mut channel = Some(opened);
    let mut events = Some(queue);
    println!("{HELP}");

    loop {
        prompt("> ");
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        warn!("stdin read failed: {}", err);
                        break;
                    }
                };
                let flow = handle_command(
                    line.trim(),
                    &mut engine,
                    &transfer,
                    &mut channel,
                    &mut events,
                    endpoint,
                    &settings.download_dir,
                )
                .await;
                if matches!(flow, Flow::Quit) {
                    break;
                }
            }
            Some(event) = next_event(events.as_mut()) => {
                if let Some(update) = engine.apply_event(event) {
                    print_update(&engine, &update);
                }
            }
            () = wait_closed(channel.as_ref()) => {
                println!("\nbackend event channel closed; new messages will not arrive");
                channel = None;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    if let Some(channel) = channel.take() {
        channel.close();
    }
    if engine.session().is_some() {
        let _ = engine.logout().await;
    }
    Ok(())
}

async fn start_session(
    engine: &mut SyncEngine,
    endpoint: BackendEndpoint,
    name: &str,
) -> Result<(EventChannel, mpsc::UnboundedReceiver<ChatEvent>), String> {
    let session = engine.login(name).await.map_err(|err| err.to_string())?;

    let channel = match EventChannel::open(endpoint).await {
        Ok(channel) => channel,
        Err(err) => {
            let _ = engine.logout().await;
            return Err(err.to_string());
        }
    };
    let events = channel.subscribe_queue();

    match engine.load_directory().await {
        Ok(peers) => println!(
            "logged in as {} ({} peers online)",
            session.display_name(),
            peers.len()
        ),
        Err(err) => println!("logged in as {}; {err}", session.display_name()),
    }
    Ok((channel, events))
}

async fn handle_command(
    line: &str,
    engine: &mut SyncEngine,
    transfer: &FileTransfer,
    channel: &mut Option<EventChannel>,
    events: &mut Option<mpsc::UnboundedReceiver<ChatEvent>>,
    endpoint: BackendEndpoint,
    download_dir: &Path,
) -> Flow {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "" => {}
        "help" => println!("{HELP}"),
        "quit" | "exit" => return Flow::Quit,
        "ls" => {
            if engine.peers().is_empty() {
                println!("no peers yet");
            }
            for peer in engine.peers().values() {
                println!("{} {} ({})", peer.avatar.glyph(), peer.display_name, peer.id);
            }
        }
        "open" => {
            let peer_id = resolve_peer(engine, rest);
            match engine.load_history(&peer_id).await {
                Ok(history) => {
                    let history = history.to_vec();
                    if history.is_empty() {
                        println!("no messages with {}", peer_label(engine, &peer_id));
                    }
                    for message in &history {
                        print_message(engine, &peer_id, message);
                    }
                }
                Err(err) => println!("{err}"),
            }
        }
        "msg" => {
            let (target, text) = rest.split_once(' ').unwrap_or((rest, ""));
            let peer_id = resolve_peer(engine, target);
            match engine.send(&peer_id, text).await {
                Ok(message) => print_message(engine, &peer_id, &message),
                Err(err) => println!("{err}"),
            }
        }
        "share" => {
            let (target, path) = rest.split_once(' ').unwrap_or((rest, ""));
            let peer_id = resolve_peer(engine, target);
            match transfer.share(engine, &peer_id, Path::new(path.trim())).await {
                Ok(descriptor) => println!("shared {} as {}", descriptor.name, descriptor.id),
                Err(err) => println!("{err}"),
            }
        }
        "get" => {
            let (file_id, name) = rest.split_once(' ').unwrap_or((rest, ""));
            let name = name.trim();
            let hint = (!name.is_empty()).then_some(name);
            match transfer.request(file_id, download_dir, hint).await {
                Ok(path) => println!("saved {}", path.display()),
                Err(err) => println!("{err}"),
            }
        }
        "login" => {
            if engine.session().is_some() {
                println!("already logged in; logout first");
            } else {
                match start_session(engine, endpoint, rest).await {
                    Ok((opened, queue)) => {
                        *channel = Some(opened);
                        *events = Some(queue);
                    }
                    Err(err) => println!("{err}"),
                }
            }
        }
        "logout" => {
            // Nothing from this session may be applied once logout starts.
            if let Some(channel) = channel.take() {
                channel.close();
            }
            *events = None;
            match engine.logout().await {
                Ok(logged_out) => println!("goodbye, {}", logged_out.display_name),
                Err(err) => println!("{err}"),
            }
        }
        other => println!("unknown command {other:?}; try help"),
    }
    Flow::Continue
}

async fn next_event(events: Option<&mut mpsc::UnboundedReceiver<ChatEvent>>) -> Option<ChatEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_closed(channel: Option<&EventChannel>) {
    match channel {
        Some(channel) => channel.closed().await,
        None => std::future::pending().await,
    }
}

/// Accepts a peer id or a display name.
fn resolve_peer(engine: &SyncEngine, token: &str) -> String {
    if engine.peer(token).is_some() {
        return token.to_owned();
    }
    engine
        .peers()
        .values()
        .find(|peer| peer.display_name.eq_ignore_ascii_case(token))
        .map(|peer| peer.id.clone())
        .unwrap_or_else(|| token.to_owned())
}

fn peer_label(engine: &SyncEngine, peer_id: &str) -> String {
    match engine.peer(peer_id) {
        Some(peer) => format!("{} {}", peer.avatar.glyph(), peer.display_name),
        None => peer_id.to_owned(),
    }
}

fn print_update(engine: &SyncEngine, update: &SyncUpdate) {
    match update {
        SyncUpdate::PeerJoined(peer) => {
            println!("\n{} {} joined ({})", peer.avatar.glyph(), peer.display_name, peer.id);
        }
        SyncUpdate::MessageReceived { peer_id, message } => {
            println!();
            print_message(engine, peer_id, message);
        }
    }
}

fn print_message(engine: &SyncEngine, peer_id: &str, message: &Message) {
    let who = match message.sender {
        Sender::Me => "me".to_owned(),
        Sender::Them => peer_label(engine, peer_id),
    };
    match &message.body {
        MessageBody::Text(text) => println!("[{who}] {text}"),
        MessageBody::File(file) => {
            println!("[{who}] file {} (get {} {})", file.name, file.id, file.name);
        }
    }
}

fn prompt(text: &str) {
    let mut stdout = io::stdout().lock();
    let _ = write!(stdout, "{text}");
    let _ = stdout.flush();
}

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let log_path = log_path();
    let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}
