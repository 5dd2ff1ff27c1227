/// ARP cache inspection and invalidation through the system `arp` binary
use crate::error::{PasarelaError, PasarelaResult};
use async_trait::async_trait;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Captured result of an external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdOutput {
    pub success: bool,
    pub code: Option<i32>,
    /// stdout followed by stderr
    pub output: String,
}

#[async_trait]
pub trait CmdRunner: Send + Sync {
    async fn run(&self, name: &str, args: &[&str]) -> io::Result<CmdOutput>;
}

/// Runs commands as child processes
#[derive(Debug, Clone, Default)]
pub struct ExecCmdRunner;

#[async_trait]
impl CmdRunner for ExecCmdRunner {
    async fn run(&self, name: &str, args: &[&str]) -> io::Result<CmdOutput> {
        let output = Command::new(name).args(args).output().await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(CmdOutput {
            success: output.status.success(),
            code: output.status.code(),
            output: combined,
        })
    }
}

#[async_trait]
pub trait ArpManager: Send + Sync {
    /// Whether the OS currently holds a resolved entry for `ip`
    async fn is_cached(&self, ip: IpAddr) -> bool;

    async fn remove_entry(&self, ip: IpAddr) -> PasarelaResult<()>;
}

/// ARP manager shelling out to `arp`; removal needs elevated privileges
pub struct PrivilegedArpManager {
    runner: Arc<dyn CmdRunner>,
    binary: String,
}

impl PrivilegedArpManager {
    pub fn new(runner: Arc<dyn CmdRunner>, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

#[async_trait]
impl ArpManager for PrivilegedArpManager {
    async fn is_cached(&self, ip: IpAddr) -> bool {
        let ip = ip.to_string();
        match self.runner.run(&self.binary, &["-n", &ip]).await {
            Ok(out) => {
                out.success
                    && out.output.contains(&ip)
                    && !out.output.contains("no entry")
                    && !out.output.contains("incomplete")
            }
            Err(e) => {
                debug!("arp lookup for {} failed: {}", ip, e);
                false
            }
        }
    }

    async fn remove_entry(&self, ip: IpAddr) -> PasarelaResult<()> {
        let ip = ip.to_string();
        match self.runner.run(&self.binary, &["-d", &ip]).await {
            Ok(out) if out.success => Ok(()),
            Ok(out) => {
                let status = match out.code {
                    Some(code) => format!("exit status {}", code),
                    None => "terminated by signal".to_string(),
                };
                Err(PasarelaError::arp(format!(
                    "failed to delete arp entry: OUTPUT={}, ERROR={}",
                    out.output, status
                )))
            }
            Err(e) => Err(PasarelaError::arp(format!(
                "failed to delete arp entry: OUTPUT=, ERROR={}",
                e
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records invocations and replays a fixed result
    pub(crate) struct FakeCmdRunner {
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
        pub result: Mutex<Option<io::Result<CmdOutput>>>,
    }

    impl FakeCmdRunner {
        pub fn returning(result: io::Result<CmdOutput>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                result: Mutex::new(Some(result)),
            }
        }
    }

    #[async_trait]
    impl CmdRunner for FakeCmdRunner {
        async fn run(&self, name: &str, args: &[&str]) -> io::Result<CmdOutput> {
            self.calls.lock().unwrap().push((
                name.to_string(),
                args.iter().map(|a| a.to_string()).collect(),
            ));
            match self.result.lock().unwrap().as_ref() {
                Some(Ok(out)) => Ok(out.clone()),
                Some(Err(e)) => Err(io::Error::new(e.kind(), e.to_string())),
                None => Ok(ok_output("")),
            }
        }
    }

    pub(crate) fn ok_output(output: &str) -> CmdOutput {
        CmdOutput {
            success: true,
            code: Some(0),
            output: output.to_string(),
        }
    }

    /// Records removals; reports every address as cached unless told otherwise
    #[derive(Default)]
    pub(crate) struct FakeArpManager {
        pub removed: Mutex<Vec<IpAddr>>,
        pub lookups: Mutex<Vec<IpAddr>>,
        pub not_cached: bool,
    }

    #[async_trait]
    impl ArpManager for FakeArpManager {
        async fn is_cached(&self, ip: IpAddr) -> bool {
            self.lookups.lock().unwrap().push(ip);
            !self.not_cached
        }

        async fn remove_entry(&self, ip: IpAddr) -> PasarelaResult<()> {
            self.removed.lock().unwrap().push(ip);
            Ok(())
        }
    }

    fn ip() -> IpAddr {
        "10.0.1.10".parse().unwrap()
    }

    #[tokio::test]
    async fn test_remove_entry_runs_arp_delete() {
        let runner = Arc::new(FakeCmdRunner::returning(Ok(ok_output(""))));
        let manager = PrivilegedArpManager::new(runner.clone(), "/usr/sbin/arp");

        manager.remove_entry(ip()).await.unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(
            calls[0],
            (
                "/usr/sbin/arp".to_string(),
                vec!["-d".to_string(), "10.0.1.10".to_string()]
            )
        );
    }

    #[tokio::test]
    async fn test_remove_entry_failure_reports_output() {
        let runner = Arc::new(FakeCmdRunner::returning(Ok(CmdOutput {
            success: false,
            code: Some(1),
            output: "SIOCDARP(dontpub): Operation not permitted".to_string(),
        })));
        let manager = PrivilegedArpManager::new(runner, "/usr/sbin/arp");

        let err = manager.remove_entry(ip()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to delete arp entry: OUTPUT=SIOCDARP(dontpub): Operation not permitted, ERROR=exit status 1"
        );
    }

    #[tokio::test]
    async fn test_remove_entry_spawn_failure() {
        let runner = Arc::new(FakeCmdRunner::returning(Err(io::Error::new(
            io::ErrorKind::NotFound,
            "no such file",
        ))));
        let manager = PrivilegedArpManager::new(runner, "/missing/arp");

        let err = manager.remove_entry(ip()).await.unwrap_err();
        assert!(matches!(err, PasarelaError::Arp { .. }));
        assert!(err.to_string().starts_with("failed to delete arp entry: OUTPUT=, ERROR="));
    }

    #[tokio::test]
    async fn test_is_cached_parses_arp_output() {
        let cached = FakeCmdRunner::returning(Ok(ok_output(
            "Address HWtype HWaddress Flags Mask Iface\n10.0.1.10 ether 52:54:00:12:34:56 C eth0\n",
        )));
        let manager = PrivilegedArpManager::new(Arc::new(cached), "arp");
        assert!(manager.is_cached(ip()).await);

        let missing = FakeCmdRunner::returning(Ok(CmdOutput {
            success: false,
            code: Some(1),
            output: "10.0.1.10 (10.0.1.10) -- no entry\n".to_string(),
        }));
        let manager = PrivilegedArpManager::new(Arc::new(missing), "arp");
        assert!(!manager.is_cached(ip()).await);

        let incomplete = FakeCmdRunner::returning(Ok(ok_output("10.0.1.10 (incomplete) eth0\n")));
        let manager = PrivilegedArpManager::new(Arc::new(incomplete), "arp");
        assert!(!manager.is_cached(ip()).await);
    }

    #[tokio::test]
    async fn test_exec_runner_captures_output() {
        let runner = ExecCmdRunner;
        let out = runner.run("sh", &["-c", "echo out; echo err >&2; exit 3"]).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }
}
