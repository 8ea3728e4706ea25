use mailpreview_core::Session;

use crate::{config_panel::Preferences, gateway::ProviderConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    /// 1-based position in the list, or a file id.
    Select(String),
    SendTest,
    Changed,
    Publish,
    Config,
    EmailAdd(String),
    EmailRemove(String),
    Prefix(String),
    Save,
    Cancel,
    Help,
    Quit,
}

impl Command {
    /// `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Command>, String> {
        let mut words = line.split_whitespace();
        let Some(verb) = words.next() else {
            return Ok(None);
        };
        let rest = words.collect::<Vec<_>>().join(" ");

        let command = match (verb.to_ascii_lowercase().as_str(), rest.as_str()) {
            ("list" | "ls", "") => Command::List,
            ("select" | "s", arg) if !arg.is_empty() => Command::Select(arg.to_owned()),
            ("send", "") => Command::SendTest,
            ("changed", "") => Command::Changed,
            ("publish", "") => Command::Publish,
            ("config", "") => Command::Config,
            ("email", arg) => match arg.split_once(' ') {
                Some(("add", addr)) => Command::EmailAdd(addr.trim().to_owned()),
                Some(("rm" | "remove", addr)) => Command::EmailRemove(addr.trim().to_owned()),
                _ => return Err("usage: email add <address> | email rm <address>".to_owned()),
            },
            ("prefix", arg) => Command::Prefix(arg.to_owned()),
            ("save", "") => Command::Save,
            ("cancel", "") => Command::Cancel,
            ("help" | "?", "") => Command::Help,
            ("quit" | "exit" | "q", "") => Command::Quit,
            (verb, _) => return Err(format!("unrecognised command {verb:?}; try `help`")),
        };
        Ok(Some(command))
    }
}

pub const HELP_TEXT: &[&str] = &[
    "list                 show templates (* selected, + updated, ! errors)",
    "select <n|id>        preview a template",
    "send                 send the selected template to the test recipients",
    "changed              compare the selected template with the published one",
    "publish              publish the selected template",
    "config               show settings and start editing them",
    "email add|rm <addr>  edit test recipients",
    "prefix <name>        edit the template naming prefix",
    "save | cancel        keep or discard settings edits",
    "quit",
];

pub fn render_list(session: &Session) -> Vec<String> {
    if session.registry().is_empty() {
        return vec!["(no templates yet)".to_owned()];
    }

    session
        .registry()
        .ordered()
        .enumerate()
        .map(|(index, record)| {
            let selected = if session.view().is_selected(&record.id) {
                '*'
            } else {
                ' '
            };
            let updated = if session.view().is_updated(record) {
                '+'
            } else {
                ' '
            };
            let errors = if record.has_errors() { '!' } else { ' ' };
            format!("{:>3} {selected}{updated}{errors} {}", index + 1, record.name)
        })
        .collect()
}

pub fn render_config(
    prefs: &Preferences,
    providers: Option<&ProviderConfig>,
    dirty: bool,
) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(providers) = providers {
        lines.push(format!("provider: {}", providers.current));
        for option in &providers.available {
            let marker = if option.key == providers.current {
                '*'
            } else {
                ' '
            };
            lines.push(format!("  {marker} {} ({})", option.value, option.key));
        }
    }
    if prefs.emails.is_empty() {
        lines.push("recipients: (none)".to_owned());
    } else {
        lines.push(format!("recipients: {}", prefs.emails.join(", ")));
    }
    lines.push(format!("prefix: {}", prefs.template_prefix()));
    if dirty {
        lines.push("(unsaved changes: `save` or `cancel`)".to_owned());
    }
    lines
}
