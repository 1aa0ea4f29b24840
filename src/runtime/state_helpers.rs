use crate::providers::WorkItem;
use crate::{Event, EventKind};
use tracing::warn;

/// Facts about the current execution, read once from its history.
#[derive(Debug, Clone, Default)]
pub struct HistoryManager {
    pub orchestration_name: Option<String>,
    pub orchestration_version: Option<String>,
    pub orchestration_input: Option<String>,
    pub is_completed: bool,
    pub is_failed: bool,
    pub is_continued_as_new: bool,
    history: Vec<Event>,
}

impl HistoryManager {
    pub fn from_history(history: &[Event]) -> Self {
        let mut mgr = Self {
            history: history.to_vec(),
            ..Self::default()
        };
        for event in history {
            match &event.kind {
                EventKind::OrchestrationStarted { name, version, input } => {
                    mgr.orchestration_name = Some(name.clone());
                    mgr.orchestration_version = Some(version.clone());
                    mgr.orchestration_input = Some(input.clone());
                }
                EventKind::OrchestrationCompleted { .. } => mgr.is_completed = true,
                EventKind::OrchestrationFailed { .. } => mgr.is_failed = true,
                EventKind::OrchestrationContinuedAsNew { .. } => mgr.is_continued_as_new = true,
                _ => {}
            }
        }
        mgr
    }

    pub fn is_terminal(&self) -> bool {
        self.is_completed || self.is_failed || self.is_continued_as_new
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn status(&self) -> &'static str {
        if self.is_completed {
            "Completed"
        } else if self.is_failed {
            "Failed"
        } else if self.is_continued_as_new {
            "ContinuedAsNew"
        } else {
            "Running"
        }
    }

    pub fn version(&self) -> Option<String> {
        self.orchestration_version.clone()
    }

    pub fn history(&self) -> &[Event] {
        &self.history
    }

    pub fn into_history(self) -> Vec<Event> {
        self.history
    }
}

/// One fetched batch split into its start item and everything else.
#[derive(Debug, Default)]
pub struct WorkItemReader {
    /// `StartOrchestration` or `ContinueAsNew`, first one wins.
    pub start_item: Option<WorkItem>,
    pub completion_messages: Vec<WorkItem>,
    pub orchestration_name: String,
    pub input: String,
    /// Requested (start) or pinned (continue-as-new) version.
    pub version: Option<String>,
    pub is_continue_as_new: bool,
    pub carry_forward: Vec<(String, String)>,
}

impl WorkItemReader {
    /// Without a start item the name comes from history; it stays empty for an
    /// instance that was never started.
    pub fn from_messages(messages: &[WorkItem], history_mgr: &HistoryManager, instance: &str) -> Self {
        let mut reader = Self::default();
        for work_item in messages {
            match work_item {
                WorkItem::StartOrchestration { .. } | WorkItem::ContinueAsNew { .. } => {
                    if reader.start_item.is_some() {
                        warn!(instance, kind = work_item.kind(), "Duplicate start in batch, ignoring");
                        continue;
                    }
                    reader.start_item = Some(work_item.clone());
                }
                WorkItem::ActivityExecute { .. } => {}
                _ => reader.completion_messages.push(work_item.clone()),
            }
        }

        match &reader.start_item {
            Some(WorkItem::StartOrchestration {
                orchestration,
                version,
                input,
                ..
            }) => {
                reader.orchestration_name = orchestration.clone();
                reader.input = input.clone();
                reader.version = version.clone();
            }
            Some(WorkItem::ContinueAsNew {
                orchestration,
                version,
                input,
                carry_forward,
                ..
            }) => {
                reader.orchestration_name = orchestration.clone();
                reader.input = input.clone();
                reader.version = Some(version.clone());
                reader.carry_forward = carry_forward.clone();
                reader.is_continue_as_new = true;
            }
            _ => {
                reader.orchestration_name = history_mgr.orchestration_name.clone().unwrap_or_default();
                reader.version = history_mgr.version();
            }
        }
        reader
    }

    pub fn has_start_item(&self) -> bool {
        self.start_item.is_some()
    }

    pub fn has_orchestration_name(&self) -> bool {
        !self.orchestration_name.is_empty()
    }
}
