//! Supervisor for file-transferer child processes. Owns every child the
//! daemon forks to move the state-file pair between peers: spawning them,
//! waiting on their exits, killing overdue ones, and cleaning or promoting
//! their temporary files.

use std::fs;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::ExitStatus;

use futures::future::select_all;
use tokio::process::{Child, Command};
use tokio::time::{Duration, Instant};

use crate::utils::ReplistateError;

/// Temp-file suffix written by downloading children.
pub(crate) const DOWNLOAD_TEMP_EXT: &str = "down";

/// Temp-file suffix written by uploading children.
pub(crate) const UPLOAD_TEMP_EXT: &str = "up";

/// Direction a transferer child moves the file pair in.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum TransfererRole {
    Download,
    Upload,
}

impl TransfererRole {
    fn mode_arg(self) -> &'static str {
        match self {
            TransfererRole::Download => "down",
            TransfererRole::Upload => "up",
        }
    }

    fn temp_ext(self) -> &'static str {
        match self {
            TransfererRole::Download => DOWNLOAD_TEMP_EXT,
            TransfererRole::Upload => UPLOAD_TEMP_EXT,
        }
    }
}

/// What became of a reaped child's work.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub(crate) enum ReapOutcome {
    /// Clean exit; for downloads the temp pair was promoted into place.
    Success,
    /// Non-zero exit, kill, or failed promotion; temp files removed.
    Failure,
    /// The pid is not tracked (already killed as overdue); nothing done.
    Untracked,
}

/// Record of one live transferer child.
#[derive(Debug)]
struct TransfererMeta {
    /// Child process id; always > 0 for a tracked record.
    pid: u32,

    /// When the child was spawned.
    started_at: Instant,

    /// Peer address the child talks to.
    peer: String,

    /// Handle used for waiting and killing.
    child: Child,
}

/// Supervisor over all transferer children of this daemon. One download at a
/// time; concurrent uploads bounded in practice by the pool size.
#[derive(Debug)]
pub(crate) struct TransfererSupervisor {
    /// Path of the transferer executable to fork.
    transferer_path: PathBuf,

    /// Path of the replicated state file.
    state_file_path: PathBuf,

    /// Path of the version file.
    version_file_path: PathBuf,

    /// The single active downloading child, if any.
    download: Option<TransfererMeta>,

    /// Active uploading children in spawn order.
    uploads: Vec<TransfererMeta>,
}

impl TransfererSupervisor {
    pub(crate) fn new(
        transferer_path: impl Into<PathBuf>,
        state_file_path: impl Into<PathBuf>,
        version_file_path: impl Into<PathBuf>,
    ) -> Self {
        TransfererSupervisor {
            transferer_path: transferer_path.into(),
            state_file_path: state_file_path.into(),
            version_file_path: version_file_path.into(),
            download: None,
            uploads: Vec::new(),
        }
    }

    /// Forks a child that pulls the file pair from `from_peer` into temp
    /// files. At most one download may be active.
    pub(crate) fn start_download(
        &mut self,
        from_peer: &str,
    ) -> Result<(), ReplistateError> {
        if let Some(meta) = &self.download {
            return Err(ReplistateError::AlreadyRunning(format!(
                "downloading transferer pid {} from '{}' still active",
                meta.pid, meta.peer
            )));
        }

        let meta = self.spawn(TransfererRole::Download, from_peer)?;
        pf_info!(
            "downloading transferer pid {} started from '{}'",
            meta.pid,
            from_peer
        );
        self.download = Some(meta);
        Ok(())
    }

    /// Forks a child that pushes the local file pair to `to_peer`.
    pub(crate) fn start_upload(
        &mut self,
        to_peer: &str,
    ) -> Result<(), ReplistateError> {
        let meta = self.spawn(TransfererRole::Upload, to_peer)?;
        pf_info!(
            "uploading transferer pid {} started toward '{}'",
            meta.pid,
            to_peer
        );
        self.uploads.push(meta);
        Ok(())
    }

    /// Waits until any tracked child exits; pends forever while none are
    /// tracked. Used as one branch of the machine's main select loop. The
    /// returned record stays tracked until `on_reaped` is called for it.
    pub(crate) async fn wait_any(
        &mut self,
    ) -> (TransfererRole, u32, Option<ExitStatus>) {
        let mut waits: Vec<
            Pin<
                Box<
                    dyn Future<
                            Output = (
                                TransfererRole,
                                u32,
                                Option<ExitStatus>,
                            ),
                        > + Send
                        + '_,
                >,
            >,
        > = Vec::new();

        if let Some(meta) = self.download.as_mut() {
            let pid = meta.pid;
            waits.push(Box::pin(async move {
                (TransfererRole::Download, pid, meta.child.wait().await.ok())
            }));
        }
        for meta in self.uploads.iter_mut() {
            let pid = meta.pid;
            waits.push(Box::pin(async move {
                (TransfererRole::Upload, pid, meta.child.wait().await.ok())
            }));
        }

        if waits.is_empty() {
            return std::future::pending().await;
        }
        let (exited, _index, _rest) = select_all(waits).await;
        exited
    }

    /// Handles one child exit reported by `wait_any`. A successful download
    /// promotes its temp pair into place; every other outcome deletes the
    /// temp files. The record for the pid is always cleared.
    pub(crate) fn on_reaped(
        &mut self,
        role: TransfererRole,
        pid: u32,
        status: Option<ExitStatus>,
    ) -> ReapOutcome {
        let tracked = match role {
            TransfererRole::Download => {
                if self.download.as_ref().map(|m| m.pid) == Some(pid) {
                    self.download = None;
                    true
                } else {
                    false
                }
            }
            TransfererRole::Upload => {
                let before = self.uploads.len();
                self.uploads.retain(|m| m.pid != pid);
                self.uploads.len() != before
            }
        };
        if !tracked {
            pf_debug!("exit of untracked transferer pid {} ignored", pid);
            return ReapOutcome::Untracked;
        }

        let clean_exit = status.map(|s| s.success()).unwrap_or(false);
        match (role, clean_exit) {
            (TransfererRole::Download, true) => {
                match self.promote_temp_files(pid) {
                    Ok(()) => {
                        pf_info!(
                            "downloading transferer pid {} succeeded, \
                             file pair promoted",
                            pid
                        );
                        ReapOutcome::Success
                    }
                    Err(e) => {
                        pf_error!(
                            "promoting download of pid {}: {}",
                            pid,
                            e
                        );
                        self.remove_temp_files(pid, DOWNLOAD_TEMP_EXT);
                        ReapOutcome::Failure
                    }
                }
            }
            (TransfererRole::Upload, true) => {
                // uploader deletes its own snapshot; double unlink is fine
                self.remove_temp_files(pid, UPLOAD_TEMP_EXT);
                ReapOutcome::Success
            }
            (role, false) => {
                pf_warn!(
                    "transferer pid {} exited with {:?}, cleaning up",
                    pid,
                    status
                );
                self.remove_temp_files(pid, role.temp_ext());
                ReapOutcome::Failure
            }
        }
    }

    /// Kills the downloading child if it outlived `max_lifetime`, deleting
    /// its temp files right away rather than waiting for the exit event.
    pub(crate) fn kill_overdue_download(
        &mut self,
        now: Instant,
        max_lifetime: Duration,
    ) {
        if let Some(meta) = &mut self.download {
            if now.duration_since(meta.started_at) > max_lifetime {
                pf_warn!(
                    "killing overdue downloading transferer pid {}",
                    meta.pid
                );
                if let Err(e) = meta.child.start_kill() {
                    pf_error!("kill of pid {} failed: {}", meta.pid, e);
                }
                let pid = meta.pid;
                self.download = None;
                self.remove_temp_files(pid, DOWNLOAD_TEMP_EXT);
            }
        }
    }

    /// Kills every uploading child that outlived `max_lifetime`, deleting
    /// their temp files right away.
    pub(crate) fn kill_overdue_uploads(
        &mut self,
        now: Instant,
        max_lifetime: Duration,
    ) {
        let state_file_path = self.state_file_path.clone();
        let version_file_path = self.version_file_path.clone();
        self.uploads.retain_mut(|meta| {
            if now.duration_since(meta.started_at) <= max_lifetime {
                return true;
            }
            pf_warn!(
                "killing overdue uploading transferer pid {}",
                meta.pid
            );
            if let Err(e) = meta.child.start_kill() {
                pf_error!("kill of pid {} failed: {}", meta.pid, e);
            }
            remove_temp_file(&state_file_path, meta.pid, UPLOAD_TEMP_EXT);
            remove_temp_file(&version_file_path, meta.pid, UPLOAD_TEMP_EXT);
            false
        });
    }

    /// Kills and clears every tracked child, deleting temp files; nothing is
    /// promoted. Used on shutdown.
    pub(crate) fn shutdown_all(&mut self) {
        if let Some(mut meta) = self.download.take() {
            let _ = meta.child.start_kill();
            self.remove_temp_files(meta.pid, DOWNLOAD_TEMP_EXT);
        }
        for mut meta in std::mem::take(&mut self.uploads) {
            let _ = meta.child.start_kill();
            self.remove_temp_files(meta.pid, UPLOAD_TEMP_EXT);
        }
    }

    /// Number of active downloading children (0 or 1).
    pub(crate) fn download_count(&self) -> usize {
        usize::from(self.download.is_some())
    }

    /// Number of active uploading children.
    pub(crate) fn upload_count(&self) -> usize {
        self.uploads.len()
    }

    fn spawn(
        &self,
        role: TransfererRole,
        peer: &str,
    ) -> Result<TransfererMeta, ReplistateError> {
        let mut child = Command::new(&self.transferer_path)
            .arg(role.mode_arg())
            .arg(&self.state_file_path)
            .arg(&self.version_file_path)
            .arg(peer)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ReplistateError::TransferFailed(format!(
                    "spawning transferer '{}': {}",
                    self.transferer_path.display(),
                    e
                ))
            })?;

        let pid = child.id().ok_or_else(|| {
            ReplistateError::TransferFailed(
                "spawned transferer exited before tracking".into(),
            )
        })?;

        Ok(TransfererMeta {
            pid,
            started_at: Instant::now(),
            peer: peer.into(),
            child,
        })
    }

    /// Renames a successfully downloaded temp pair into place, state file
    /// first so a failure never leaves a new version file describing old
    /// state contents.
    fn promote_temp_files(&self, pid: u32) -> Result<(), ReplistateError> {
        for path in [&self.state_file_path, &self.version_file_path] {
            let temp = temp_file_path(path, pid, DOWNLOAD_TEMP_EXT);
            fs::rename(&temp, path).map_err(|e| {
                ReplistateError::TransferFailed(format!(
                    "promoting '{}': {}",
                    temp.display(),
                    e
                ))
            })?;
        }
        Ok(())
    }

    fn remove_temp_files(&self, pid: u32, ext: &str) {
        remove_temp_file(&self.state_file_path, pid, ext);
        remove_temp_file(&self.version_file_path, pid, ext);
    }
}

/// `<path>.<pid>.<ext>` for a child's temporary copy of one file.
pub(crate) fn temp_file_path(path: &Path, pid: u32, ext: &str) -> PathBuf {
    PathBuf::from(format!("{}.{}.{}", path.display(), pid, ext))
}

fn remove_temp_file(path: &Path, pid: u32, ext: &str) {
    let temp = temp_file_path(path, pid, ext);
    match fs::remove_file(&temp) {
        Ok(()) => pf_debug!("removed temp file '{}'", temp.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => {
            pf_error!("removing temp file '{}': {}", temp.display(), e)
        }
    }
}


#[cfg(test)]
mod transferer_tests {
    use super::testutil::*;
    use super::*;

    fn supervisor_with_stub(dir: &Path, stub_body: &str) -> TransfererSupervisor {
        let stub = write_stub_transferer(dir, "transferer.sh", stub_body);
        TransfererSupervisor::new(
            stub,
            dir.join("state"),
            dir.join("version"),
        )
    }

    #[tokio::test]
    async fn one_download_at_a_time() -> Result<(), ReplistateError> {
        let dir = test_dir("single_download");
        let mut sup = supervisor_with_stub(&dir, "exec sleep 30");

        sup.start_download("10.0.0.2:9618")?;
        assert_eq!(sup.download_count(), 1);
        let res = sup.start_download("10.0.0.3:9618");
        assert!(matches!(res, Err(ReplistateError::AlreadyRunning(_))));
        assert_eq!(sup.download_count(), 1);

        sup.shutdown_all();
        assert_eq!(sup.download_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn successful_download_promotes_pair(
    ) -> Result<(), ReplistateError> {
        let dir = test_dir("download_promote");
        // the stub plays a downloading child: it writes both temp files
        // under its own pid, then exits 0
        let mut sup = supervisor_with_stub(
            &dir,
            "echo 'downloaded state' > \"$2.$$.down\"\n\
             echo '7 42 10.0.0.2:9618' > \"$3.$$.down\"",
        );

        sup.start_download("10.0.0.2:9618")?;
        let (role, pid, status) = sup.wait_any().await;
        assert_eq!(role, TransfererRole::Download);
        assert!(status.unwrap().success());

        let outcome = sup.on_reaped(role, pid, status);
        assert_eq!(outcome, ReapOutcome::Success);
        assert_eq!(sup.download_count(), 0);
        assert_eq!(
            fs::read_to_string(dir.join("state"))?.trim_end(),
            "downloaded state"
        );
        assert_eq!(
            fs::read_to_string(dir.join("version"))?.trim_end(),
            "7 42 10.0.0.2:9618"
        );
        // no temp leak
        assert!(!temp_file_path(&dir.join("state"), pid, "down").exists());
        assert!(!temp_file_path(&dir.join("version"), pid, "down").exists());
        Ok(())
    }

    #[tokio::test]
    async fn failed_download_cleans_temp_files(
    ) -> Result<(), ReplistateError> {
        let dir = test_dir("download_fail");
        let mut sup = supervisor_with_stub(
            &dir,
            "echo 'partial' > \"$2.$$.down\"\nexit 1",
        );

        sup.start_download("10.0.0.2:9618")?;
        let (role, pid, status) = sup.wait_any().await;
        assert!(!status.unwrap().success());

        let outcome = sup.on_reaped(role, pid, status);
        assert_eq!(outcome, ReapOutcome::Failure);
        assert!(!dir.join("state").exists());
        assert!(!temp_file_path(&dir.join("state"), pid, "down").exists());
        Ok(())
    }

    #[tokio::test]
    async fn missing_temp_pair_is_a_failure() -> Result<(), ReplistateError> {
        let dir = test_dir("download_incomplete");
        // exits 0 but produced only one of the two files: promotion of the
        // pair must fail and clean up
        let mut sup = supervisor_with_stub(
            &dir,
            "echo 'downloaded state' > \"$2.$$.down\"",
        );

        sup.start_download("10.0.0.2:9618")?;
        let (role, pid, status) = sup.wait_any().await;
        let outcome = sup.on_reaped(role, pid, status);
        assert_eq!(outcome, ReapOutcome::Failure);
        assert!(!dir.join("version").exists());
        assert!(!temp_file_path(&dir.join("state"), pid, "down").exists());
        Ok(())
    }

    #[tokio::test]
    async fn overdue_upload_killed_and_cleaned(
    ) -> Result<(), ReplistateError> {
        let dir = test_dir("upload_overdue");
        let mut sup = supervisor_with_stub(
            &dir,
            "echo snap > \"$2.$$.up\"\necho snap > \"$3.$$.up\"\nexec sleep 30",
        );

        sup.start_upload("10.0.0.2:9618")?;
        sup.start_upload("10.0.0.3:9618")?;
        assert_eq!(sup.upload_count(), 2);

        // give the stubs a moment to write their snapshots
        tokio::time::sleep(Duration::from_millis(200)).await;
        sup.kill_overdue_uploads(Instant::now(), Duration::from_millis(50));
        assert_eq!(sup.upload_count(), 0);

        let leftovers: Vec<_> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".up"))
            .collect();
        assert!(leftovers.is_empty(), "temp leak: {:?}", leftovers);
        Ok(())
    }

    #[tokio::test]
    async fn fresh_download_not_killed() -> Result<(), ReplistateError> {
        let dir = test_dir("download_fresh");
        let mut sup = supervisor_with_stub(&dir, "exec sleep 30");

        sup.start_download("10.0.0.2:9618")?;
        sup.kill_overdue_download(Instant::now(), Duration::from_secs(300));
        assert_eq!(sup.download_count(), 1);

        sup.kill_overdue_download(
            Instant::now() + Duration::from_secs(301),
            Duration::from_secs(300),
        );
        assert_eq!(sup.download_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn overdue_kill_frees_download_slot(
    ) -> Result<(), ReplistateError> {
        let dir = test_dir("reap_untracked");
        let mut sup = supervisor_with_stub(&dir, "exec sleep 30");

        sup.start_download("10.0.0.2:9618")?;
        sup.kill_overdue_download(
            Instant::now() + Duration::from_secs(301),
            Duration::from_secs(300),
        );

        // a replacement slot opens immediately
        sup.start_download("10.0.0.3:9618")?;
        assert_eq!(sup.download_count(), 1);
        sup.shutdown_all();
        Ok(())
    }
}
