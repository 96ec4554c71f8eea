//! Per-session workspace state and its transitions.
//!
//! Every user action is an `Event`; `Workspace::apply` turns the current state
//! and one event into the next state. Running the committed snippet is left to
//! the host, which asks `should_execute` after any event for which
//! `Event::changes_inputs` is true and feeds the report back as
//! `Event::RunFinished`, tagged with the `generation` it ran against.
//! Reports from an older generation are dropped.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::cell::Value;
use crate::executor::RunReport;
use crate::loader::{Upload, ingest};
use crate::table::{Registry, Table};
use crate::views;

/// Snippet shown in a fresh editor.
pub const DEFAULT_SNIPPET: &str = r#"// Example: line chart from the combined table
let fig = px::line(df_all, df_all.columns[0], df_all.columns[1], "__source__");
show(fig);"#;

/// Rows of each dataset included in the workspace preview.
const PREVIEW_ROWS: usize = 5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Page {
    #[default]
    Workspace,
    Projects,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

/// A message for the user produced by the last action.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notice {
    pub level: Level,
    pub message: String,
}

impl Notice {
    fn new(level: Level, message: impl Into<String>) -> Self {
        Notice {
            level,
            message: message.into(),
        }
    }
}

/// Everything that can happen to a workspace.
#[derive(Debug)]
pub enum Event {
    /// The full current upload selection.
    UploadsChanged(Vec<Upload>),
    Reset,
    /// The editor text the user asked to run.
    SnippetCommitted(String),
    RunFinished {
        generation: u64,
        report: RunReport,
    },
    SaveFormOpened,
    SaveFormClosed,
    ProjectSaved { id: String, name: String },
    ProjectLoaded {
        id: String,
        snippet: String,
        registry: Registry,
    },
    Navigate(Page),
    DeleteRequested(String),
    DeleteCancelled,
    ProjectDeleted(String),
}

impl Event {
    /// Whether the event may change the registry or the committed snippet,
    /// after which the snippet has to run again.
    pub fn changes_inputs(&self) -> bool {
        matches!(
            self,
            Event::UploadsChanged(_)
                | Event::Reset
                | Event::SnippetCommitted(_)
                | Event::ProjectLoaded { .. }
        )
    }
}

#[derive(Clone, Debug)]
pub struct Workspace {
    pub registry: Registry,
    /// Current editor text.
    pub editor: String,
    /// Last snippet the user ran; re-executed whenever inputs change.
    pub snippet: Option<String>,
    /// True once the uploader has held files since the last load or clear.
    pub uploader_active: bool,
    pub save_form_open: bool,
    /// Project the current data came from or was last saved as.
    pub loaded_project: Option<String>,
    /// Project awaiting delete confirmation.
    pub pending_delete: Option<String>,
    pub page: Page,
    /// Bumped to make the client forget its upload selection.
    pub uploader_epoch: u64,
    /// Bumped to make the client reload the editor text.
    pub editor_epoch: u64,
    pub notices: Vec<Notice>,
    pub last_run: Option<RunReport>,
    /// Bumped by every event that changes the run inputs.
    pub generation: u64,
}

impl Default for Workspace {
    fn default() -> Self {
        Workspace {
            registry: Registry::new(),
            editor: DEFAULT_SNIPPET.to_string(),
            snippet: None,
            uploader_active: false,
            save_form_open: false,
            loaded_project: None,
            pending_delete: None,
            page: Page::Workspace,
            uploader_epoch: 0,
            editor_epoch: 0,
            notices: Vec::new(),
            last_run: None,
            generation: 0,
        }
    }
}

impl Workspace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one event and return the next state.
    ///
    /// Notices only describe the event that produced them, so they are
    /// cleared first; a finished run keeps the notices of the action that
    /// triggered it.
    pub fn apply(mut self, event: Event) -> Self {
        if !matches!(event, Event::RunFinished { .. }) {
            self.notices.clear();
        }
        if event.changes_inputs() {
            self.generation += 1;
        }

        match event {
            Event::UploadsChanged(files) => self.sync_uploads(files),
            Event::Reset => {
                self.registry.clear();
                self.editor = DEFAULT_SNIPPET.to_string();
                self.snippet = None;
                self.save_form_open = false;
                self.loaded_project = None;
                self.pending_delete = None;
                self.uploader_active = false;
                self.last_run = None;
                self.bump_epochs();
            }
            Event::SnippetCommitted(code) => {
                self.editor = code.clone();
                if self.can_run() {
                    self.snippet = Some(code);
                } else {
                    self.notices.push(Notice::new(
                        Level::Warning,
                        "Upload at least one file before running code.",
                    ));
                }
            }
            Event::RunFinished { generation, report } => {
                if generation == self.generation {
                    self.last_run = Some(report);
                }
            }
            Event::SaveFormOpened => self.save_form_open = true,
            Event::SaveFormClosed => self.save_form_open = false,
            Event::ProjectSaved { id, name } => {
                self.save_form_open = false;
                self.loaded_project = Some(id);
                self.notices.push(Notice::new(
                    Level::Success,
                    format!("✅ “{}” saved! You’ll find it in the Projects tab.", name),
                ));
            }
            Event::ProjectLoaded {
                id,
                snippet,
                registry,
            } => {
                self.registry = registry;
                self.editor = snippet.clone();
                self.snippet = Some(snippet);
                self.page = Page::Workspace;
                self.uploader_active = false;
                self.save_form_open = false;
                self.pending_delete = None;
                self.loaded_project = Some(id);
                self.last_run = None;
                self.bump_epochs();
            }
            Event::Navigate(page) => self.page = page,
            Event::DeleteRequested(id) => self.pending_delete = Some(id),
            Event::DeleteCancelled => self.pending_delete = None,
            Event::ProjectDeleted(id) => {
                if self.loaded_project.as_deref() == Some(id.as_str()) {
                    self.loaded_project = None;
                }
                self.pending_delete = None;
            }
        }

        if self.registry.is_empty() {
            self.last_run = None;
        }
        self
    }

    fn sync_uploads(&mut self, files: Vec<Upload>) {
        if files.is_empty() {
            // An empty selection only means "removed everything" when the
            // uploader was the source of the data; after a load it is empty
            // from the start.
            if self.uploader_active {
                self.registry.clear();
                self.uploader_active = false;
            }
            return;
        }

        self.uploader_active = true;
        let report = ingest(&mut self.registry, &files);
        for failure in report.failures {
            self.notices.push(Notice::new(Level::Error, failure.to_string()));
        }

        let selected: HashSet<String> = files.into_iter().map(|f| f.name).collect();
        self.registry.retain_names(&selected);
    }

    fn bump_epochs(&mut self) {
        self.uploader_epoch += 1;
        self.editor_epoch += 1;
    }

    /// The execution action is only available with data to run against.
    pub fn can_run(&self) -> bool {
        !self.registry.is_empty()
    }

    /// Snippet the host should run now, if any.
    pub fn should_execute(&self) -> Option<&str> {
        if self.can_run() {
            self.snippet.as_deref()
        } else {
            None
        }
    }

    pub fn combined(&self) -> Option<Table> {
        views::build_combined(&self.registry)
    }

    /// Serializable snapshot for the client.
    pub fn view(&self) -> WorkspaceView {
        let datasets = self
            .registry
            .iter()
            .map(|d| DatasetPreview {
                name: d.name.clone(),
                alias: views::alias_for(&d.name),
                rows: d.table.height(),
                columns: d.table.columns().to_vec(),
                head: d.table.head(PREVIEW_ROWS).rows().to_vec(),
            })
            .collect();

        WorkspaceView {
            page: self.page,
            datasets,
            combined_rows: self.combined().map(|t| t.height()),
            hint: if self.can_run() {
                Some(views::hint(&self.registry))
            } else {
                None
            },
            editor: self.editor.clone(),
            snippet: self.snippet.clone(),
            can_run: self.can_run(),
            uploader_active: self.uploader_active,
            save_form_open: self.save_form_open,
            loaded_project: self.loaded_project.clone(),
            pending_delete: self.pending_delete.clone(),
            uploader_epoch: self.uploader_epoch,
            editor_epoch: self.editor_epoch,
            notices: self.notices.clone(),
            last_run: self.last_run.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct DatasetPreview {
    pub name: String,
    pub alias: String,
    pub rows: usize,
    pub columns: Vec<String>,
    pub head: Vec<Vec<Value>>,
}

#[derive(Clone, Debug, Serialize)]
pub struct WorkspaceView {
    pub page: Page,
    pub datasets: Vec<DatasetPreview>,
    pub combined_rows: Option<usize>,
    pub hint: Option<String>,
    pub editor: String,
    pub snippet: Option<String>,
    pub can_run: bool,
    pub uploader_active: bool,
    pub save_form_open: bool,
    pub loaded_project: Option<String>,
    pub pending_delete: Option<String>,
    pub uploader_epoch: u64,
    pub editor_epoch: u64,
    pub notices: Vec<Notice>,
    pub last_run: Option<RunReport>,
}
