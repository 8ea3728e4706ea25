use std::{path::PathBuf, time::Duration};

use mailpreview_core::{EventBus, FileId, FileUpdate, Session, SessionEvent, Timestamp};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    actions::{self, Notification},
    config_panel::{ConfigPanel, Preferences},
    console::{Command, HELP_TEXT, render_config, render_list},
    gateway::{ChannelEvent, Gateway, KEEPALIVE_INTERVAL, ProviderConfig, supervise_push_channel},
    preview::{FrameCommand, LoadStrategy, PreviewFrame, PreviewSource},
    storage::LocalStore,
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub strategy: LoadStrategy,
    pub keepalive: Duration,
    /// Revealed previews are written here as `<id>.html`.
    pub preview_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            strategy: LoadStrategy::OnLoadEvent,
            keepalive: KEEPALIVE_INTERVAL,
            preview_dir: None,
        }
    }
}

#[derive(Debug)]
enum Internal {
    Listing(Result<Vec<FileUpdate>, String>),
    Providers(ProviderConfig),
    PreviewFetched {
        generation: u64,
        result: Result<String, String>,
    },
    RevealDue {
        generation: u64,
    },
    Notify(Notification),
}

/// The view-side event loop. It is the single owner of the session, so
/// every push message, HTTP completion and user command is applied here,
/// one at a time and in arrival order.
pub struct App {
    gateway: Gateway,
    session: Session,
    frame: PreviewFrame,
    store: LocalStore,
    prefs: Preferences,
    panel: Option<ConfigPanel>,
    providers: Option<ProviderConfig>,
    preview_dir: Option<PathBuf>,
    keepalive: Duration,
    loaded_preview: Option<(u64, String)>,
    connections: u32,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
    out: mpsc::UnboundedSender<String>,
}

impl App {
    pub fn new(
        gateway: Gateway,
        store: LocalStore,
        config: AppConfig,
        out: mpsc::UnboundedSender<String>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            prefs: Preferences::load(&store),
            gateway,
            session: Session::new(),
            frame: PreviewFrame::new(config.strategy),
            store,
            panel: None,
            providers: None,
            preview_dir: config.preview_dir,
            keepalive: config.keepalive,
            loaded_preview: None,
            connections: 0,
            internal_tx,
            internal_rx: Some(internal_rx),
            out,
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let Some(mut internal_rx) = self.internal_rx.take() else {
            return;
        };
        let mut session_rx = self.session.subscribe();

        let mut channel_bus = EventBus::new();
        let mut channel_rx = channel_bus.subscribe();
        let supervisor = tokio::spawn(supervise_push_channel(
            self.gateway.endpoints().push_url().clone(),
            self.keepalive,
            channel_bus,
        ));

        info!(base = %self.gateway.endpoints().http_base(), "preview client starting");
        self.request_listing();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Quit) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = channel_rx.recv() => self.handle_channel(event),
                Some(internal) = internal_rx.recv() => self.handle_internal(internal),
            }

            while let Ok(event) = session_rx.try_recv() {
                self.handle_session_event(event);
            }
        }

        supervisor.abort();
        info!("preview client stopped");
    }

    fn say(&self, line: impl Into<String>) {
        let _ = self.out.send(line.into());
    }

    fn say_all(&self, lines: Vec<String>) {
        for line in lines {
            self.say(line);
        }
    }

    fn request_listing(&self) {
        let gateway = self.gateway.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = gateway.list_files().await.map_err(|err| err.to_string());
            let _ = tx.send(Internal::Listing(result));
        });
    }

    fn request_providers(&self) {
        let gateway = self.gateway.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            match gateway.email_provider_config().await {
                Ok(providers) => {
                    let _ = tx.send(Internal::Providers(providers));
                }
                Err(err) => warn!("provider config fetch failed: {err}"),
            }
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::List => self.say_all(render_list(&self.session)),
            Command::Select(target) => match self.resolve(&target) {
                Some(id) => {
                    if let Err(err) = self.session.select(&id, Timestamp::now()) {
                        self.say(err.to_string());
                    }
                }
                None => self.say(format!("no template matches {target:?}")),
            },
            Command::SendTest | Command::Changed | Command::Publish => self.run_action(command),
            Command::Config => {
                self.open_panel();
                if let Some(panel) = &self.panel {
                    let lines =
                        render_config(panel.draft(), panel.providers(), panel.is_dirty());
                    self.say_all(lines);
                }
            }
            Command::EmailAdd(address) => {
                let result = self.open_panel().add_email(&address);
                match result {
                    Ok(true) => self.say(format!("added {address}")),
                    Ok(false) => self.say(format!("{address} is already listed")),
                    Err(err) => self.say(err.to_string()),
                }
            }
            Command::EmailRemove(address) => {
                if self.open_panel().remove_email(&address) {
                    self.say(format!("removed {address}"));
                } else {
                    self.say(format!("{address} is not listed"));
                }
            }
            Command::Prefix(prefix) => {
                self.open_panel().set_prefix(&prefix);
                self.say("prefix updated");
            }
            Command::Save => {
                let Some(panel) = self.panel.as_mut() else {
                    self.say("nothing to save");
                    return;
                };
                match panel.save(&mut self.store) {
                    Ok(prefs) => {
                        self.prefs = prefs;
                        self.panel = None;
                        self.say("settings saved");
                    }
                    Err(err) => {
                        // The panel stays open with its edits.
                        warn!(path = %self.store.path().display(), "saving settings failed: {err}");
                        self.say(format!("saving settings failed: {err}"));
                    }
                }
            }
            Command::Cancel => {
                if let Some(panel) = self.panel.take() {
                    self.prefs = panel.cancel();
                    self.say("settings edits discarded");
                }
            }
            Command::Help => self.say_all(HELP_TEXT.iter().map(|line| (*line).to_owned()).collect()),
            Command::Quit => {}
        }
    }

    fn open_panel(&mut self) -> &mut ConfigPanel {
        if self.panel.is_none() {
            self.request_providers();
        }
        let store = &self.store;
        let cached = self.providers.as_ref();
        self.panel.get_or_insert_with(|| {
            let mut panel = ConfigPanel::open(store);
            if let Some(providers) = cached {
                panel.set_providers(providers.clone());
            }
            panel
        })
    }

    fn resolve(&self, target: &str) -> Option<FileId> {
        if let Ok(position) = target.parse::<usize>() {
            return self
                .session
                .registry()
                .ordered()
                .nth(position.checked_sub(1)?)
                .map(|record| record.id.clone());
        }
        let id = FileId::new(target);
        self.session.registry().contains(&id).then_some(id)
    }

    fn run_action(&self, command: Command) {
        let gateway = self.gateway.clone();
        let selected = self.session.selected_record().cloned();
        let prefs = self.prefs.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let notification = match command {
                Command::SendTest => actions::send_test(&gateway, selected.as_ref(), &prefs).await,
                Command::Changed => {
                    actions::check_changed(&gateway, selected.as_ref(), &prefs).await
                }
                Command::Publish => actions::publish(&gateway, selected.as_ref(), &prefs).await,
                _ => None,
            };
            if let Some(notification) = notification {
                let _ = tx.send(Internal::Notify(notification));
            }
        });
    }

    fn handle_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Connected => {
                self.connections += 1;
                if self.connections > 1 {
                    // Changes made while disconnected were never pushed.
                    self.say("reconnected");
                    self.request_listing();
                } else {
                    self.say("connected");
                }
            }
            ChannelEvent::FileChanged(update) => {
                let id = update.id.clone();
                if let Err(err) = self.session.apply_change(update, Timestamp::now()) {
                    warn!(id = %id, "ignoring file change: {err}");
                }
            }
            ChannelEvent::Closed { reason } => self.say(format!("connection lost: {reason}")),
            ChannelEvent::GaveUp { error } => {
                self.say(format!("live updates unavailable: {error}"));
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Listing(Ok(files)) => {
                if let Err(err) = self.session.load_listing(files, Timestamp::now()) {
                    warn!("ignoring file listing: {err}");
                }
            }
            Internal::Listing(Err(err)) => warn!("file listing failed: {err}"),
            Internal::Providers(providers) => {
                if let Some(panel) = self.panel.as_mut() {
                    panel.set_providers(providers.clone());
                }
                self.providers = Some(providers);
            }
            Internal::PreviewFetched { generation, result } => match result {
                Ok(html) => {
                    if self.frame.current_generation() != Some(generation) {
                        debug!(generation, "dropping stale preview");
                        return;
                    }
                    self.loaded_preview = Some((generation, html));
                    if self.frame.is_revealed() {
                        // Revealed on a timer before the content arrived.
                        self.write_preview(generation);
                    } else {
                        let commands = self.frame.loaded(generation);
                        self.execute_frame(commands);
                    }
                }
                Err(err) => warn!(generation, "preview load failed: {err}"),
            },
            Internal::RevealDue { generation } => {
                let commands = self.frame.delay_elapsed(generation);
                self.execute_frame(commands);
            }
            Internal::Notify(notification) => {
                for line in notification.text.lines() {
                    self.say(line);
                }
            }
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Listed { .. } => self.say_all(render_list(&self.session)),
            SessionEvent::Deselected { .. } => {
                let commands = self.frame.set_source(None);
                self.execute_frame(commands);
            }
            SessionEvent::Selected { id, revision } | SessionEvent::Refreshed { id, revision } => {
                let Some(record) = self.session.registry().get(&id) else {
                    return;
                };
                let src = match self.gateway.preview_url(record) {
                    Ok(src) => src,
                    Err(err) => {
                        warn!(id = %id, "no preview url: {err}");
                        return;
                    }
                };
                self.say(format!("viewing {}", record.name));
                let commands = self.frame.set_source(Some(PreviewSource { src, revision }));
                self.execute_frame(commands);
            }
            SessionEvent::TemplateChanged { id, inserted, .. } => {
                if inserted {
                    self.say_all(render_list(&self.session));
                } else if let Some(record) = self.session.registry().get(&id) {
                    self.say(format!("updated {}", record.name));
                }
            }
            SessionEvent::Removed { id } => self.say(format!("removed {id}")),
        }
    }

    fn execute_frame(&mut self, commands: Vec<FrameCommand>) {
        for command in commands {
            match command {
                FrameCommand::ShowPlaceholder => {}
                FrameCommand::Unmount => self.loaded_preview = None,
                FrameCommand::Mount { src, generation } => {
                    let gateway = self.gateway.clone();
                    let tx = self.internal_tx.clone();
                    tokio::spawn(async move {
                        let result = gateway.fetch_preview(&src).await.map_err(|err| err.to_string());
                        let _ = tx.send(Internal::PreviewFetched { generation, result });
                    });
                }
                FrameCommand::ScheduleReveal { generation, after } => {
                    let tx = self.internal_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(Internal::RevealDue { generation });
                    });
                }
                FrameCommand::Reveal { generation } => self.write_preview(generation),
            }
        }
    }

    /// Emits the preview once the frame is revealed and its content is in.
    fn write_preview(&self, generation: u64) {
        let html = match &self.loaded_preview {
            Some((loaded, html)) if *loaded == generation => html.as_str(),
            _ => {
                debug!(generation, "preview revealed before its content arrived");
                return;
            }
        };
        let Some(record) = self.session.selected_record() else {
            return;
        };

        match &self.preview_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.html", record.id));
                let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, html));
                match written {
                    Ok(()) => self.say(format!("preview ready: {}", path.display())),
                    Err(err) => {
                        warn!(path = %path.display(), "writing preview failed: {err}");
                        self.say(format!("preview ready ({} bytes)", html.len()));
                    }
                }
            }
            None => self.say(format!("preview ready ({} bytes)", html.len())),
        }
    }
}
