#![allow(dead_code)]

use reqwest::blocking::{Client, Response};
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

pub struct ServerGuard {
    child: Child,
    stderr_thread: Option<thread::JoinHandle<()>>,
    client: Client,
    base_url: String,
}

impl Drop for ServerGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
    }
}

impl ServerGuard {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn get(&self, path: &str) -> anyhow::Result<Response> {
        Ok(self.client.get(self.url(path)).send()?)
    }

    pub fn delete(&self, path: &str) -> anyhow::Result<Response> {
        Ok(self.client.delete(self.url(path)).send()?)
    }

    pub fn post(&self, path: &str, body: &Value) -> anyhow::Result<Response> {
        Ok(self.client.post(self.url(path)).json(body).send()?)
    }

    pub fn post_raw(&self, path: &str, body: &str) -> anyhow::Result<Response> {
        Ok(self
            .client
            .post(self.url(path))
            .header("content-type", "application/json")
            .body(body.to_string())
            .send()?)
    }

    pub fn new_session(&self) -> anyhow::Result<String> {
        let body: Value = self.client.post(self.url("/api/session")).send()?.json()?;
        body["session"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("no session id in {body}"))
    }

    pub fn execute(&self, session: &str, level: u32, query: &str) -> anyhow::Result<Value> {
        let body: Value = self
            .post(
                "/api/execute",
                &serde_json::json!({ "sessionId": session, "level": level, "query": query }),
            )?
            .json()?;
        Ok(body["result"].clone())
    }
}

pub fn spawn_server() -> anyhow::Result<ServerGuard> {
    spawn_server_with(&[])
}

pub fn spawn_server_with(extra_args: &[&str]) -> anyhow::Result<ServerGuard> {
    let bin = env!("CARGO_BIN_EXE_sqlquest");

    let mut child = Command::new(bin)
        .args(["--listen", "127.0.0.1:0"])
        .args(extra_args)
        .env_remove("RUST_LOG")
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to capture server stderr"))?;

    let (addr_tx, addr_rx) = mpsc::channel::<SocketAddr>();
    let stderr_thread = thread::spawn(move || {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        while reader
            .read_line(&mut line)
            .ok()
            .filter(|n| *n > 0)
            .is_some()
        {
            if let Some(rest) = line.strip_prefix("sqlquest listening on ") {
                if let Ok(addr) = rest.trim().parse::<SocketAddr>() {
                    let _ = addr_tx.send(addr);
                }
            }
            eprint!("{}", line);
            line.clear();
        }
    });

    let addr = match addr_rx.recv_timeout(Duration::from_secs(10)) {
        Ok(addr) => addr,
        Err(err) => {
            if let Some(status) = child.try_wait()? {
                anyhow::bail!("server exited before reporting listen address: {status} ({err})");
            }
            let _ = child.kill();
            anyhow::bail!("timed out waiting for server listen address: {err}");
        }
    };

    let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
    Ok(ServerGuard {
        child,
        stderr_thread: Some(stderr_thread),
        client,
        base_url: format!("http://{addr}"),
    })
}
