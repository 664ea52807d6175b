//! Turns conversation snapshots into incremental terminal output.

use std::collections::HashSet;

use coachstream_conversation::{
    ContextualUpdate, ConversationSnapshot, LookupPanel, Message, MessageId, Role,
};

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Send(String),
    Stop,
    Explain(String),
    Close,
    Quit,
    Empty,
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let (head, rest) = line
            .split_once(char::is_whitespace)
            .map(|(head, rest)| (head, rest.trim()))
            .unwrap_or((line, ""));

        match head {
            "" => Self::Empty,
            "/stop" => Self::Stop,
            "/close" => Self::Close,
            "/quit" | "/exit" => Self::Quit,
            "/explain" if rest.is_empty() => Self::Empty,
            "/explain" => Self::Explain(rest.to_string()),
            _ => Self::Send(line.to_string()),
        }
    }
}

/// One piece of terminal output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleOutput {
    /// Written without a trailing newline (streamed text).
    Inline(String),
    Line(String),
}

#[derive(Debug)]
struct StreamedReply {
    id: MessageId,
    printed: String,
}

/// Diffs consecutive snapshots so that each piece of text is printed once.
#[derive(Debug)]
pub struct TranscriptRenderer {
    settled: HashSet<MessageId>,
    streamed: Option<StreamedReply>,
    contextual: Option<ContextualUpdate>,
    lookup: LookupPanel,
}

impl TranscriptRenderer {
    /// Starts after `snapshot`; its messages count as already shown.
    pub fn new(snapshot: &ConversationSnapshot) -> Self {
        Self {
            settled: snapshot
                .messages
                .iter()
                .filter(|message| !message.is_placeholder())
                .map(|message| message.id)
                .collect(),
            streamed: None,
            contextual: snapshot.scratch.contextual_update.clone(),
            lookup: snapshot.lookup.clone(),
        }
    }

    pub fn render(&mut self, snapshot: &ConversationSnapshot) -> Vec<ConsoleOutput> {
        let mut output = Vec::new();
        self.render_contextual(snapshot, &mut output);
        self.render_placeholder(snapshot, &mut output);
        self.render_settled(snapshot, &mut output);
        self.render_lookup(snapshot, &mut output);
        output
    }

    fn render_contextual(
        &mut self,
        snapshot: &ConversationSnapshot,
        output: &mut Vec<ConsoleOutput>,
    ) {
        let current = &snapshot.scratch.contextual_update;
        if *current == self.contextual {
            return;
        }

        if let Some(update) = current {
            let line = match &update.stage {
                Some(stage) => format!("  ({stage}) {}", update.text),
                None => format!("  ({})", update.text),
            };
            output.push(ConsoleOutput::Line(line));
        }
        self.contextual = current.clone();
    }

    fn render_placeholder(
        &mut self,
        snapshot: &ConversationSnapshot,
        output: &mut Vec<ConsoleOutput>,
    ) {
        if let Some(streamed) = &self.streamed
            && snapshot.message(streamed.id).is_none()
        {
            output.push(ConsoleOutput::Line(" [stopped]".to_string()));
            self.streamed = None;
        }

        let Some(placeholder) = snapshot.placeholder() else {
            return;
        };
        if placeholder.content.is_empty() {
            return;
        }

        let streamed = self.streamed.get_or_insert_with(|| {
            output.push(ConsoleOutput::Inline("coach> ".to_string()));
            StreamedReply {
                id: placeholder.id,
                printed: String::new(),
            }
        });
        if let Some(delta) = placeholder.content.strip_prefix(streamed.printed.as_str())
            && !delta.is_empty()
        {
            output.push(ConsoleOutput::Inline(delta.to_string()));
            streamed.printed = placeholder.content.clone();
        }
    }

    fn render_settled(&mut self, snapshot: &ConversationSnapshot, output: &mut Vec<ConsoleOutput>) {
        for message in &snapshot.messages {
            if message.is_placeholder() || !self.settled.insert(message.id) {
                continue;
            }
            if message.role == Role::User {
                continue;
            }

            match self.streamed.take() {
                Some(streamed) if streamed.id == message.id => {
                    finish_streamed(&streamed.printed, message, output);
                }
                other => {
                    self.streamed = other;
                    output.push(ConsoleOutput::Line(reply_line(message)));
                }
            }
        }
    }

    fn render_lookup(&mut self, snapshot: &ConversationSnapshot, output: &mut Vec<ConsoleOutput>) {
        let panel = &snapshot.lookup;
        if *panel == self.lookup {
            return;
        }

        if let Some(term) = &panel.term {
            if panel.loading {
                output.push(ConsoleOutput::Line(format!("  looking up '{term}'...")));
            } else if let Some(explanation) = &panel.explanation {
                output.push(ConsoleOutput::Line(format!(
                    "  {term}: {}",
                    explanation.explanation
                )));
            } else if let Some(error) = &panel.error {
                output.push(ConsoleOutput::Line(format!(
                    "  could not explain '{term}': {error}"
                )));
            }
        }
        self.lookup = panel.clone();
    }
}

fn finish_streamed(printed: &str, message: &Message, output: &mut Vec<ConsoleOutput>) {
    match message.content.strip_prefix(printed) {
        Some(rest) => {
            if !rest.is_empty() {
                output.push(ConsoleOutput::Inline(rest.to_string()));
            }
            output.push(ConsoleOutput::Line(String::new()));
        }
        // The authoritative reply differs from what was streamed.
        None => {
            output.push(ConsoleOutput::Line(String::new()));
            output.push(ConsoleOutput::Line(reply_line(message)));
        }
    }
}

fn reply_line(message: &Message) -> String {
    if message.is_error() {
        format!("error> {}", message.content)
    } else {
        format!("coach> {}", message.content)
    }
}
