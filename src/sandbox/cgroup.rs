// Resource limits for bare bot processes, via a per-invocation cgroup under the user's
// systemd slice. Only available on linux; other targets get a stub that always fails.

use super::ResourceLimits;

#[cfg(target_os = "linux")]
pub use linux::CgroupGuard;
#[cfg(not(target_os = "linux"))]
pub use stub::CgroupGuard;

#[cfg(target_os = "linux")]
mod linux {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::OnceLock;
    use std::time::{Duration, Instant};

    use cgroups_rs::cgroup_builder::CgroupBuilder;
    use cgroups_rs::{hierarchies, Cgroup, CgroupPid, MaxValue};

    use super::ResourceLimits;

    const CPU_PERIOD_US: u64 = 100_000;
    const CLEANUP_WAIT: Duration = Duration::from_millis(50);

    fn current_user_id() -> Result<&'static str, String> {
        static USER_ID: OnceLock<Result<String, String>> = OnceLock::new();
        USER_ID
            .get_or_init(|| {
                let output = std::process::Command::new("id")
                    .arg("-u")
                    .output()
                    .map_err(|e| format!("could not launch 'id -u': {e}"))?;
                let id = std::str::from_utf8(&output.stdout)
                    .map_err(|_| "id is not a valid string".to_string())?;
                Ok(id.trim().to_string())
            })
            .as_deref()
            .map_err(Clone::clone)
    }

    fn cgroup_path(user_id: &str, group_name: &str) -> String {
        format!("user.slice/user-{user_id}.slice/user@{user_id}.service/{group_name}")
    }

    /// A cgroup holding one bot process tree. Killed and deleted on drop.
    #[derive(Debug)]
    pub struct CgroupGuard {
        cgroup: Option<Cgroup>,
    }

    impl CgroupGuard {
        pub fn create(limits: &ResourceLimits) -> Result<Self, String> {
            static COUNTER: AtomicU32 = AtomicU32::new(1);
            let name = format!(
                "pac-arena-{}-{}",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed)
            );
            let path = cgroup_path(current_user_id()?, &name);

            let quota = (limits.cpus * CPU_PERIOD_US as f64).round() as i64;
            let cgroup = CgroupBuilder::new(&path)
                .memory()
                .memory_hard_limit(limits.memory_mb as i64 * 1024 * 1024)
                .done()
                .pid()
                .maximum_number_of_processes(MaxValue::Value(limits.pids as i64))
                .done()
                .cpu()
                .period(CPU_PERIOD_US)
                .quota(quota.max(1000))
                .done()
                .build(hierarchies::auto())
                .map_err(|e| format!("could not create cgroup: {e}"))?;

            Ok(CgroupGuard {
                cgroup: Some(cgroup),
            })
        }

        pub fn add(&self, pid: u32) -> Result<(), String> {
            let cgroup = self
                .cgroup
                .as_ref()
                .ok_or_else(|| "cgroup already released".to_string())?;
            cgroup
                .add_task_by_tgid(CgroupPid { pid: pid as u64 })
                .map_err(|e| format!("could not add process to cgroup: {e}"))
        }

        pub fn is_released(&self) -> bool {
            self.cgroup.is_none()
        }

        /// Kill every process in the group, then remove it. Inside a tokio runtime the removal
        /// runs on the blocking pool so the caller's task never sleeps.
        pub fn release(&mut self) {
            let Some(cgroup) = self.cgroup.take() else {
                return;
            };
            if let Err(e) = cgroup.kill() {
                tracing::warn!(error = %e, "could not kill cgroup members");
            }
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || remove(cgroup));
                }
                Err(_) => remove(cgroup),
            }
        }
    }

    fn remove(cgroup: Cgroup) {
        let deadline = Instant::now() + CLEANUP_WAIT;
        while !cgroup.tasks().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        if let Err(e) = cgroup.delete() {
            tracing::warn!(error = %e, "failed to remove cgroup");
        }
    }

    impl Drop for CgroupGuard {
        fn drop(&mut self) {
            self.release();
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn limits() -> ResourceLimits {
            ResourceLimits {
                memory_mb: 64,
                cpus: 0.5,
                pids: 16,
            }
        }

        #[tokio::test(flavor = "current_thread")]
        async fn test_release_does_not_block_the_task() {
            // Needs a delegated cgroup subtree; nothing to check without one.
            let Ok(mut guard) = CgroupGuard::create(&limits()) else {
                return;
            };
            let mut child = tokio::process::Command::new("sleep")
                .arg("5")
                .kill_on_drop(true)
                .spawn()
                .unwrap();
            if guard.add(child.id().unwrap()).is_err() {
                return;
            }

            let started = Instant::now();
            guard.release();
            assert!(started.elapsed() < CLEANUP_WAIT);
            assert!(guard.is_released());
            assert!(guard.add(1).is_err());
            guard.release();
            let _ = child.kill().await;
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod stub {
    use super::ResourceLimits;

    #[derive(Debug)]
    pub struct CgroupGuard {}

    impl CgroupGuard {
        pub fn create(_limits: &ResourceLimits) -> Result<Self, String> {
            Err("cgroups only available on linux".to_string())
        }

        pub fn add(&self, _pid: u32) -> Result<(), String> {
            Err("cgroups only available on linux".to_string())
        }

        pub fn is_released(&self) -> bool {
            true
        }

        pub fn release(&mut self) {}
    }
}
