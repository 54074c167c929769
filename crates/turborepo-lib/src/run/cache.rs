use std::{
    io::Write,
    sync::{Arc, Mutex},
};

use tracing::warn;
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPathBuf};
use turborepo_cache::{AsyncCache, CacheError, CacheHitMetadata};
use turborepo_engine::{OutputLogsMode, TaskDefinition, TaskOutputs};
use turborepo_globwalk::WalkType;
use turborepo_task_id::TaskId;

use crate::{
    daemon::OutputHints,
    opts::RunCacheOpts,
    ui::PrefixedWriter,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Globwalk(#[from] turborepo_globwalk::WalkError),
    #[error(transparent)]
    Path(#[from] turbopath::PathError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Run-wide cache policy plus the shared facade handle; hands out one
/// [`TaskCache`] per task.
pub struct RunCache {
    cache: AsyncCache,
    reads_disabled: bool,
    writes_disabled: bool,
    task_output_logs_override: Option<OutputLogsMode>,
    repo_root: AbsoluteSystemPathBuf,
    output_hints: OutputHints,
}

impl RunCache {
    pub fn new(
        cache: AsyncCache,
        repo_root: &AbsoluteSystemPath,
        opts: &RunCacheOpts,
        output_hints: OutputHints,
    ) -> Self {
        RunCache {
            cache,
            reads_disabled: opts.skip_reads,
            writes_disabled: opts.skip_writes,
            task_output_logs_override: opts.task_output_logs_override,
            repo_root: repo_root.to_owned(),
            output_hints,
        }
    }

    pub fn task_cache(
        self: &Arc<Self>,
        task_definition: &TaskDefinition,
        package_dir: &AnchoredSystemPathBuf,
        task_id: &TaskId<'static>,
        hash: &str,
    ) -> TaskCache {
        // Output globs are declared package-relative; the cache works in
        // repo-relative unix globs.
        let package_unix = package_dir
            .to_unix()
            .map(|p| p.into_string())
            .unwrap_or_default();
        let prefix_glob = |glob: &String| {
            if package_unix.is_empty() {
                glob.clone()
            } else {
                format!("{package_unix}/{glob}")
            }
        };
        let repo_relative_globs = TaskOutputs {
            inclusions: task_definition.outputs.inclusions.iter().map(prefix_glob).collect(),
            exclusions: task_definition.outputs.exclusions.iter().map(prefix_glob).collect(),
        };

        let log_file_name = TaskDefinition::log_file_name(task_id.task());
        let log_file_path = self
            .repo_root
            .resolve(package_dir)
            .join_components(&[".turbo", log_file_name.as_str()]);

        TaskCache {
            run_cache: self.clone(),
            repo_relative_globs,
            hash: hash.to_string(),
            task_id: task_id.clone(),
            task_output_logs: self
                .task_output_logs_override
                .unwrap_or(task_definition.output_logs),
            caching_disabled: !task_definition.cache,
            log_file_path,
            expanded_outputs: Mutex::new(Vec::new()),
            declared_outputs: !task_definition.outputs.inclusions.is_empty(),
        }
    }

    /// Drains pending cache writes. Call once, at the end of the run,
    /// after every [`TaskCache`] has been dropped.
    pub async fn shutdown(self) {
        self.cache.shutdown().await;
    }
}

/// Per-task view of the cache: lookup, log replay, output capture, save.
pub struct TaskCache {
    run_cache: Arc<RunCache>,
    repo_relative_globs: TaskOutputs,
    hash: String,
    task_id: TaskId<'static>,
    task_output_logs: OutputLogsMode,
    caching_disabled: bool,
    log_file_path: AbsoluteSystemPathBuf,
    expanded_outputs: Mutex<Vec<AnchoredSystemPathBuf>>,
    declared_outputs: bool,
}

impl TaskCache {
    pub fn log_file_path(&self) -> &AbsoluteSystemPath {
        &self.log_file_path
    }

    pub fn expanded_outputs(&self) -> Vec<AnchoredSystemPathBuf> {
        self.expanded_outputs
            .lock()
            .expect("expanded outputs mutex poisoned")
            .clone()
    }

    /// Probes the cache without restoring anything, for dry runs.
    pub async fn exists(&self) -> Result<Option<CacheHitMetadata>, Error> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            return Ok(None);
        }
        Ok(self.run_cache.cache.exists(&self.hash).await?)
    }

    /// Replays the captured log per the output mode.
    pub fn replay_log_file<W: Write>(
        &self,
        output: &mut PrefixedWriter<W>,
    ) -> Result<(), Error> {
        if self.log_file_path.exists() {
            crate::ui::replay_logs(output, &self.log_file_path)?;
        }
        Ok(())
    }

    /// After a failure, show the tail end of what happened for modes that
    /// suppressed it live.
    pub fn on_error<W: Write>(&self, output: &mut PrefixedWriter<W>) -> Result<(), Error> {
        if self.task_output_logs == OutputLogsMode::ErrorsOnly {
            output.write_line(&format!("cache miss, executing {}", self.hash))?;
            self.replay_log_file(output)?;
        }
        Ok(())
    }

    /// Checks the cache for this task's fingerprint and restores outputs
    /// on a hit. Returns the hit metadata, or `None` for a miss.
    pub async fn restore_outputs<W: Write>(
        &self,
        output: &mut PrefixedWriter<W>,
    ) -> Result<Option<CacheHitMetadata>, Error> {
        if self.caching_disabled || self.run_cache.reads_disabled {
            if !matches!(
                self.task_output_logs,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                output.write_line(&format!("cache bypass, force executing {}", self.hash))?;
            }
            return Ok(None);
        }

        // When the daemon can prove no declared output changed since the
        // last save, the files on disk are already correct and only the
        // log needs replaying.
        let changed_globs = self
            .run_cache
            .output_hints
            .changed_outputs(&self.hash, &self.repo_relative_globs.inclusions)
            .await;
        let has_changed_outputs = changed_globs.map_or(true, |changed| !changed.is_empty());

        let cache_status = if has_changed_outputs {
            let fetched = self
                .run_cache
                .cache
                .fetch(&self.run_cache.repo_root, &self.hash)
                .await?;
            match fetched {
                Some((status, restored_files)) => {
                    *self
                        .expanded_outputs
                        .lock()
                        .expect("expanded outputs mutex poisoned") = restored_files;
                    self.notify_outputs_written(status.time_saved).await;
                    Some(status)
                }
                None => None,
            }
        } else {
            self.run_cache.cache.exists(&self.hash).await?
        };

        let Some(cache_status) = cache_status else {
            if !matches!(
                self.task_output_logs,
                OutputLogsMode::None | OutputLogsMode::ErrorsOnly
            ) {
                output.write_line(&format!("cache miss, executing {}", self.hash))?;
            }
            return Ok(None);
        };

        match self.task_output_logs {
            OutputLogsMode::Full => {
                output.write_line(&format!("cache hit, replaying logs {}", self.hash))?;
                self.replay_log_file(output)?;
            }
            OutputLogsMode::HashOnly | OutputLogsMode::NewOnly => {
                output.write_line(&format!("cache hit, suppressing logs {}", self.hash))?;
            }
            OutputLogsMode::None | OutputLogsMode::ErrorsOnly => (),
        }

        Ok(Some(cache_status))
    }

    /// A writer that tees task output into the log file and, depending on
    /// the mode, the terminal.
    pub fn output_writer<W: Write>(&self, terminal: PrefixedWriter<W>) -> Result<LogWriter<W>, Error> {
        let log_to_terminal = matches!(
            self.task_output_logs,
            OutputLogsMode::Full | OutputLogsMode::NewOnly
        );

        // The log file is written even for cache-disabled tasks so
        // `--output-logs errors-only` has something to replay.
        self.log_file_path
            .parent()
            .expect("log file has a parent directory")
            .create_dir_all()?;
        let log_file = std::io::BufWriter::new(
            self.log_file_path
                .open_with_options({
                    let mut options = std::fs::OpenOptions::new();
                    options.write(true).create(true).truncate(true);
                    options
                })?,
        );

        Ok(LogWriter {
            log_file: Some(log_file),
            terminal: log_to_terminal.then_some(terminal),
        })
    }

    /// Globs the declared outputs (plus the log file) and queues the
    /// archive write. Warns when declared outputs matched nothing.
    pub async fn save_outputs(&self, duration_ms: u64) -> Result<(), Error> {
        if self.caching_disabled || self.run_cache.writes_disabled {
            return Ok(());
        }

        let mut inclusions = self.repo_relative_globs.inclusions.clone();
        // The captured log rides along in every artifact.
        if let Ok(log_relative) = self.run_cache.repo_root.anchor(&self.log_file_path) {
            if let Ok(unix) = log_relative.to_unix() {
                inclusions.push(unix.into_string());
            }
        }

        let files = turborepo_globwalk::globwalk(
            &self.run_cache.repo_root,
            &inclusions,
            &self.repo_relative_globs.exclusions,
            WalkType::All,
        )?;
        let anchored: Result<Vec<AnchoredSystemPathBuf>, _> = files
            .iter()
            .map(|file| self.run_cache.repo_root.anchor(file))
            .collect();
        let anchored = anchored?;

        if self.declared_outputs {
            let log_relative = self.run_cache.repo_root.anchor(&self.log_file_path).ok();
            let has_non_log_output = anchored
                .iter()
                .any(|file| Some(file) != log_relative.as_ref());
            if !has_non_log_output {
                warn!(
                    "no output files found for task {}. Please check your `outputs` key in `turbo.json`",
                    self.task_id
                );
            }
        }

        *self
            .expanded_outputs
            .lock()
            .expect("expanded outputs mutex poisoned") = anchored.clone();

        self.run_cache
            .cache
            .put(
                self.run_cache.repo_root.clone(),
                &self.hash,
                anchored,
                duration_ms,
            )
            .await?;

        self.notify_outputs_written(duration_ms).await;
        Ok(())
    }

    async fn notify_outputs_written(&self, time_saved: u64) {
        self.run_cache
            .output_hints
            .notify_outputs_written(
                &self.hash,
                &self.repo_relative_globs.inclusions,
                &self.repo_relative_globs.exclusions,
                time_saved,
            )
            .await;
    }
}

/// Tee for child output: always the log file, optionally the terminal.
pub struct LogWriter<W: Write> {
    log_file: Option<std::io::BufWriter<std::fs::File>>,
    terminal: Option<PrefixedWriter<W>>,
}

impl<W: Write> Write for LogWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(log_file) = &mut self.log_file {
            log_file.write_all(buf)?;
        }
        if let Some(terminal) = &mut self.terminal {
            terminal.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(log_file) = &mut self.log_file {
            log_file.flush()?;
        }
        if let Some(terminal) = &mut self.terminal {
            terminal.flush()?;
        }
        Ok(())
    }
}
