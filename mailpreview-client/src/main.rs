use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use clap::Parser;
use mailpreview_client::{
    App, AppConfig, Gateway,
    console::Command,
    gateway::KEEPALIVE_INTERVAL,
    preview::LoadStrategy,
    storage::{LocalStore, storage_dir},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    runtime::Runtime,
    sync::mpsc,
};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;
use url::Url;

#[derive(Parser, Debug, Clone)]
#[command(name = "mailpreview")]
struct ClientArgs {
    /// Address of the preview backend; request and push-channel URLs derive from it.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    base_url: String,

    /// Where settings are kept. `MAILPREVIEW_STORAGE_DIR` overrides the default.
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Write each revealed preview here as `<id>.html`.
    #[arg(long)]
    preview_dir: Option<PathBuf>,

    #[arg(long, default_value = concat!("mailpreview/", env!("CARGO_PKG_VERSION")))]
    user_agent: String,

    #[arg(long)]
    log_file: Option<PathBuf>,
}

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

fn main() {
    let args = ClientArgs::parse();
    init_logging(args.log_file.as_deref());

    let runtime = match Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("tokio runtime init failed: {err}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(run(args));
    // Stdin is read on a blocking thread that never notices the app quit.
    runtime.shutdown_timeout(Duration::from_millis(200));

    if let Err(err) = result {
        error!("{err}");
        eprintln!("mailpreview: {err}");
        std::process::exit(1);
    }
}

async fn run(args: ClientArgs) -> Result<(), String> {
    let origin = Url::parse(&args.base_url)
        .map_err(|err| format!("invalid base url {}: {err}", args.base_url))?;
    let gateway = Gateway::new(&origin, &args.user_agent).map_err(|err| err.to_string())?;

    let storage_path = args
        .storage_dir
        .unwrap_or_else(storage_dir)
        .join("storage.json");
    info!(path = %storage_path.display(), "using local storage");
    let store = LocalStore::open_or_empty(storage_path);

    let config = AppConfig {
        strategy: LoadStrategy::for_user_agent(&args.user_agent),
        keepalive: KEEPALIVE_INTERVAL,
        preview_dir: args.preview_dir,
    };

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (command_tx, command_rx) = mpsc::unbounded_channel::<Command>();

    let printer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            println!("{line}");
        }
    });
    let reader = tokio::spawn(read_commands(command_tx, out_tx.clone()));

    App::new(gateway, store, config, out_tx).run(command_rx).await;

    reader.abort();
    let _ = printer.await;
    Ok(())
}

async fn read_commands(commands: mpsc::UnboundedSender<Command>, out: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match Command::parse(&line) {
                Ok(Some(command)) => {
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(message) => {
                    let _ = out.send(message);
                }
            },
            Ok(None) => break,
            Err(err) => {
                warn!("stdin read failed: {err}");
                break;
            }
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
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
        .init();
}
