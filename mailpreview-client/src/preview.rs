use std::time::Duration;

use url::Url;

/// Fallback reveal delay for frames whose load signal cannot be trusted.
pub const FALLBACK_REVEAL_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    /// Reveal when the frame reports load completion.
    OnLoadEvent,
    /// Reveal after a fixed delay, whatever the frame reports.
    FixedDelay(Duration),
}

impl LoadStrategy {
    pub fn for_user_agent(user_agent: &str) -> Self {
        let is_ie = user_agent.contains("MSIE") || user_agent.to_lowercase().contains("rv:11.0");
        let is_edge = user_agent.contains("Edge");
        if is_ie || is_edge {
            LoadStrategy::FixedDelay(FALLBACK_REVEAL_DELAY)
        } else {
            LoadStrategy::OnLoadEvent
        }
    }
}

/// What the frame should display: a URL plus the revision of the file it
/// renders. A new revision of the same URL still reloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewSource {
    pub src: Url,
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameCommand {
    ShowPlaceholder,
    Unmount,
    Mount { src: Url, generation: u64 },
    ScheduleReveal { generation: u64, after: Duration },
    Reveal { generation: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameState {
    Empty,
    Loading { source: PreviewSource, generation: u64 },
    Shown { source: PreviewSource, generation: u64 },
}

/// Embedded preview loader. It emits commands for whatever actually hosts
/// the frame and ignores load signals from generations it has moved past.
#[derive(Debug)]
pub struct PreviewFrame {
    strategy: LoadStrategy,
    state: FrameState,
    generation: u64,
}

impl PreviewFrame {
    pub fn new(strategy: LoadStrategy) -> Self {
        Self {
            strategy,
            state: FrameState::Empty,
            generation: 0,
        }
    }

    /// Generation of the frame currently loading or shown.
    pub fn current_generation(&self) -> Option<u64> {
        match &self.state {
            FrameState::Empty => None,
            FrameState::Loading { generation, .. } | FrameState::Shown { generation, .. } => {
                Some(*generation)
            }
        }
    }

    pub fn state(&self) -> &FrameState {
        &self.state
    }

    pub fn current_source(&self) -> Option<&PreviewSource> {
        match &self.state {
            FrameState::Empty => None,
            FrameState::Loading { source, .. } | FrameState::Shown { source, .. } => Some(source),
        }
    }

    pub fn is_revealed(&self) -> bool {
        matches!(self.state, FrameState::Shown { .. })
    }

    pub fn set_source(&mut self, source: Option<PreviewSource>) -> Vec<FrameCommand> {
        if source.is_none() && matches!(self.state, FrameState::Empty) {
            return vec![FrameCommand::ShowPlaceholder];
        }
        if self.current_source() == source.as_ref() {
            return Vec::new();
        }

        let mut commands = vec![FrameCommand::ShowPlaceholder];
        if !matches!(self.state, FrameState::Empty) {
            commands.push(FrameCommand::Unmount);
        }

        let Some(source) = source else {
            self.state = FrameState::Empty;
            return commands;
        };

        self.generation += 1;
        let generation = self.generation;
        commands.push(FrameCommand::Mount {
            src: source.src.clone(),
            generation,
        });
        if let LoadStrategy::FixedDelay(after) = self.strategy {
            commands.push(FrameCommand::ScheduleReveal { generation, after });
        }
        self.state = FrameState::Loading { source, generation };
        commands
    }

    /// The frame reported load completion.
    pub fn loaded(&mut self, generation: u64) -> Vec<FrameCommand> {
        match self.strategy {
            LoadStrategy::OnLoadEvent => self.reveal(generation),
            LoadStrategy::FixedDelay(_) => Vec::new(),
        }
    }

    /// A reveal scheduled by `ScheduleReveal` came due.
    pub fn delay_elapsed(&mut self, generation: u64) -> Vec<FrameCommand> {
        match self.strategy {
            LoadStrategy::FixedDelay(_) => self.reveal(generation),
            LoadStrategy::OnLoadEvent => Vec::new(),
        }
    }

    fn reveal(&mut self, generation: u64) -> Vec<FrameCommand> {
        let state = std::mem::replace(&mut self.state, FrameState::Empty);
        match state {
            FrameState::Loading {
                source,
                generation: current,
            } if current == generation => {
                self.state = FrameState::Shown { source, generation };
                vec![FrameCommand::Reveal { generation }]
            }
            other => {
                self.state = other;
                Vec::new()
            }
        }
    }
}
