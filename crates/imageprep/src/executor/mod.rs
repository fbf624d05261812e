use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::{ConfigDoc, ProvisionVars};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::log_sanitize::sanitize_log_line;
use crate::planner::Plan;
use crate::state::RunState;
use crate::workspace::{CleanMode, WorkspaceConfig, WorkspacePaths};

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

#[derive(Default)]
struct SharedExecState {
    workspace_paths: Mutex<Option<WorkspacePaths>>,
    run: Mutex<RunState>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    /// A fatal condition worth its own line on the error stream.
    TaskError {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Progress on stdout, `ERROR:` lines on stderr, a summary at the end.
#[derive(Default)]
pub struct StdoutSink {
    state: Mutex<StdoutSinkState>,
}

#[derive(Default)]
struct StdoutSinkState {
    started_at: Option<Instant>,
    tasks_started: usize,
    tasks_ok: usize,
    tasks_failed: usize,
    log_lines: usize,
    failed_tasks: Vec<String>,
    task_logs: BTreeMap<String, VecDeque<String>>,
    error_logs_dir: Option<PathBuf>,
    error_log_paths: Vec<PathBuf>,
}

impl ExecSink for StdoutSink {
    fn emit(&self, ev: ExecEvent) {
        let Ok(mut s) = self.state.lock() else {
            return;
        };
        match ev {
            ExecEvent::TaskStarted { id } => {
                s.tasks_started += 1;
                s.started_at.get_or_insert_with(Instant::now);
                println!("RUN: {id}");
            }
            ExecEvent::TaskLog { id, line } => {
                s.log_lines += 1;
                append_task_log_line(&mut s.task_logs, &id, &line);
                println!("[{id}] {line}");
            }
            ExecEvent::TaskError { id, line } => {
                append_task_log_line(&mut s.task_logs, &id, &format!("ERROR: {line}"));
                eprintln!("ERROR: {line}");
            }
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if ok {
                    s.tasks_ok += 1;
                    s.task_logs.remove(&id);
                    println!("DONE: {id} ({elapsed_ms}ms)");
                    return;
                }
                s.tasks_failed += 1;
                s.failed_tasks.push(id.clone());
                let err_text = error.unwrap_or_default();
                eprintln!("ERROR: {id}: {err_text}");
                match write_task_error_log(&mut s, &id, &err_text, elapsed_ms) {
                    Ok(path) => eprintln!("ERROR_LOG: {id} => {}", path.display()),
                    Err(e) => eprintln!("WARN: failed to write task error log for {id}: {e}"),
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                println!("SUMMARY:");
                println!("  status: {}", if ok { "ok" } else { "failed" });
                println!(
                    "  tasks: started={} ok={} failed={}",
                    s.tasks_started, s.tasks_ok, s.tasks_failed
                );
                println!("  logs: {}", s.log_lines);
                println!("  elapsed: {}", format_elapsed_hms(wall.as_secs()));
                if !s.failed_tasks.is_empty() {
                    println!("  failed_tasks: {}", s.failed_tasks.join(", "));
                }
                for p in &s.error_log_paths {
                    println!("  error_log: {}", p.display());
                }
                if let Some(e) = error.filter(|_| !ok) {
                    eprintln!("ERROR: {e}");
                }
                *s = StdoutSinkState::default();
            }
        }
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_task_id: Option<String>,
    host: Arc<dyn Host>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>, host: Arc<dyn Host>) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            host,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn host(&self) -> Arc<dyn Host> {
        Arc::clone(&self.host)
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    fn task_id(&self) -> String {
        self.current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into())
    }

    pub fn log(&self, msg: &str) {
        self.sink.emit(ExecEvent::TaskLog {
            id: self.task_id(),
            line: msg.to_string(),
        });
    }

    pub fn error(&self, msg: &str) {
        self.sink.emit(ExecEvent::TaskError {
            id: self.task_id(),
            line: msg.to_string(),
        });
    }

    pub fn set_workspace_paths(&self, paths: WorkspacePaths) {
        if let Ok(mut g) = self.shared.workspace_paths.lock() {
            *g = Some(paths);
        }
    }

    pub fn workspace_paths(&self) -> Option<WorkspacePaths> {
        self.shared
            .workspace_paths
            .lock()
            .ok()
            .and_then(|g| g.clone())
    }

    // Cleaning is only applied by core.init.
    pub fn workspace_paths_or_init(&self, doc: &ConfigDoc) -> Result<WorkspacePaths> {
        if let Some(p) = self.workspace_paths() {
            return Ok(p);
        }

        let mut ws: WorkspaceConfig = doc.deserialize_path("workspace")?.unwrap_or_default();
        if !ws.enabled {
            return crate::workspace::load_paths(&WorkspaceConfig::default());
        }
        ws.clean = CleanMode::None;
        let paths = crate::workspace::init_dirs(&ws)?;
        self.set_workspace_paths(paths.clone());
        Ok(paths)
    }

    pub fn state(&self) -> RunState {
        self.shared
            .run
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    pub fn update_state<F: FnOnce(&mut RunState)>(&self, f: F) {
        if let Ok(mut g) = self.shared.run.lock() {
            f(&mut g);
        }
    }

    pub fn vars(&self) -> Result<ProvisionVars> {
        self.state()
            .vars
            .ok_or_else(|| Error::msg("run variables are not resolved"))
    }

    pub fn persist_state(&self, doc: &ConfigDoc) -> Result<()> {
        let Some(ws) = self.workspace_paths() else {
            return Ok(());
        };
        let path = ws.run_dir(&doc.build_name()).join("state.json");
        self.state().save(&path)
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate task executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }

    pub fn ids(&self) -> BTreeSet<&'static str> {
        self.exec.keys().copied().collect()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Runs the plan strictly in order; the first failing task ends the run.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let ordered = plan.ordered()?;
    for task in &ordered {
        if reg.get(&task.id).is_none() {
            return Err(Error::msg(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        }
    }

    for task in ordered {
        let Some(exec) = reg.get(&task.id) else {
            continue;
        };
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());

        if ctx.dry_run {
            ctx.log(&format!(
                "DRY-RUN: {} ({}/{})",
                task.id, task.module, task.phase
            ));
            ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms: 0,
            });
            continue;
        }

        tracing::info!(task = %task.id, "task started");
        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        if let Err(e) = ctx.persist_state(doc) {
            tracing::warn!(error = %e, "failed to persist run state");
        }

        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                tracing::info!(task = %task.id, error = %e, "task failed");
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let err = Error::msg(format!("task '{}' failed: {e}", task.id));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(err.to_string()),
                });
                return Err(err);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn builtin_registry() -> Result<TaskRegistry> {
    use crate::modules;

    let mut reg = TaskRegistry::default();
    modules::core::CoreModule::register_tasks(&mut reg)?;
    modules::preflight::PreflightModule::register_tasks(&mut reg)?;
    modules::packages::PackagesModule::register_tasks(&mut reg)?;
    modules::dotnet::DotnetModule::register_tasks(&mut reg)?;
    modules::pwsh::PwshModule::register_tasks(&mut reg)?;
    modules::runner::RunnerModule::register_tasks(&mut reg)?;
    modules::stage::StageModule::register_tasks(&mut reg)?;
    modules::cleanup::CleanupModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn append_task_log_line(
    task_logs: &mut BTreeMap<String, VecDeque<String>>,
    task_id: &str,
    line: &str,
) {
    const MAX_LINES: usize = 4000;
    let q = task_logs.entry(task_id.to_string()).or_default();
    while q.len() >= MAX_LINES {
        q.pop_front();
    }
    q.push_back(sanitize_log_line(line));
}

fn write_task_error_log(
    state: &mut StdoutSinkState,
    task_id: &str,
    error: &str,
    elapsed_ms: u128,
) -> Result<PathBuf> {
    let dir = match state.error_logs_dir.clone() {
        Some(d) => d,
        None => {
            let dir = std::env::current_dir()
                .unwrap_or_else(|_| PathBuf::from("."))
                .join("build")
                .join("error-logs")
                .join(chrono::Local::now().format("%Y%m%d-%H%M%S").to_string());
            fs::create_dir_all(&dir).map_err(|e| {
                Error::msg(format!(
                    "failed to create error logs dir {}: {e}",
                    dir.display()
                ))
            })?;
            state.error_logs_dir = Some(dir.clone());
            dir
        }
    };
    let path = dir.join(format!("{}.log", sanitize_filename_component(task_id)));

    let mut body = format!("task: {task_id}\nstatus: failed\nelapsed_ms: {elapsed_ms}\n");
    if !error.trim().is_empty() {
        body.push_str(&format!("error: {error}\n"));
    }
    body.push_str("\nlogs:\n");
    for line in state.task_logs.get(task_id).into_iter().flatten() {
        body.push_str(line);
        body.push('\n');
    }

    fs::write(&path, body).map_err(|e| {
        Error::msg(format!(
            "failed to write task error log {}: {e}",
            path.display()
        ))
    })?;
    state.error_log_paths.push(path.clone());
    Ok(path)
}

fn sanitize_filename_component(raw: &str) -> String {
    let out: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '_' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() { "task".into() } else { out }
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
