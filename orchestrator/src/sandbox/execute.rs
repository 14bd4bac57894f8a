//! One-shot code execution: a short-lived self-managed sandbox that writes
//! a source file, optionally compiles, runs, and always destroys itself.

use std::time::Duration;

use axum::extract::ws::Message;
use serde::Serialize;
use serde_json::{json, Value};
use shared_types::Tier;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::warn;
use uuid::Uuid;

use crate::auth::KeyIdentity;
use crate::error::{Error, Result};
use crate::rpc::ClientSubject;
use crate::sandbox::SandboxManager;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 300;
const AGENT_BOOT_WAIT: Duration = Duration::from_secs(30);

/// Supported execution languages. Each variant knows its source file name,
/// an optional compile step, and its run command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    JavaScript,
    TypeScript,
    Python,
    Java,
    Cpp,
    C,
    Go,
    Rust,
}

impl Language {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "javascript" => Some(Language::JavaScript),
            "typescript" => Some(Language::TypeScript),
            "python" => Some(Language::Python),
            "java" => Some(Language::Java),
            "cpp" => Some(Language::Cpp),
            "c" => Some(Language::C),
            "go" => Some(Language::Go),
            "rust" => Some(Language::Rust),
            _ => None,
        }
    }

    pub fn source_file(&self) -> &'static str {
        match self {
            Language::JavaScript => "main.js",
            Language::TypeScript => "main.ts",
            Language::Python => "main.py",
            Language::Java => "Main.java",
            Language::Cpp => "main.cpp",
            Language::C => "main.c",
            Language::Go => "main.go",
            Language::Rust => "main.rs",
        }
    }

    /// Compile command, for the compiled subset.
    pub fn compile_command(&self) -> Option<(&'static str, Vec<&'static str>)> {
        match self {
            Language::Java => Some(("javac", vec!["Main.java"])),
            Language::Cpp => Some(("g++", vec!["-std=c++17", "main.cpp", "-o", "main"])),
            Language::C => Some(("gcc", vec!["main.c", "-o", "main"])),
            Language::Rust => Some(("rustc", vec!["main.rs", "-o", "main"])),
            Language::JavaScript | Language::TypeScript | Language::Python | Language::Go => None,
        }
    }

    pub fn run_command(&self) -> (&'static str, Vec<&'static str>) {
        match self {
            Language::JavaScript => ("node", vec!["main.js"]),
            Language::TypeScript => ("ts-node", vec!["main.ts"]),
            Language::Python => ("python3", vec!["main.py"]),
            Language::Java => ("java", vec!["Main"]),
            Language::Cpp | Language::C | Language::Rust => ("./main", vec![]),
            Language::Go => ("go", vec!["run", "main.go"]),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_result: Option<CompileResult>,
}

/// An in-process client session on the hub, used by the execute path to
/// drive the agent like any external SDK client would.
struct ExecClient {
    manager: SandboxManager,
    sandbox_id: Uuid,
    session_id: Uuid,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl ExecClient {
    async fn attach(manager: &SandboxManager, sandbox_id: Uuid) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = manager
            .hub
            .register_client(sandbox_id, ClientSubject::Unauthenticated, tx)
            .await;
        Self {
            manager: manager.clone(),
            sandbox_id,
            session_id,
            rx,
        }
    }

    /// Send one frame and wait for the reply with the matching id.
    async fn call(&mut self, mut frame: Value, deadline: Duration) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        frame["id"] = json!(id);
        let raw = frame.to_string();
        self.manager
            .hub
            .client_frame(self.sandbox_id, self.session_id, &raw)
            .await;

        let reply = timeout(deadline, async {
            while let Some(message) = self.rx.recv().await {
                match message {
                    Message::Text(text) => {
                        if let Ok(value) = serde_json::from_str::<Value>(text.as_str()) {
                            if value.get("id").and_then(Value::as_str) == Some(id.as_str()) {
                                return Some(value);
                            }
                        }
                    }
                    Message::Close(_) => return None,
                    _ => {}
                }
            }
            None
        })
        .await
        .map_err(|_| Error::Other(anyhow::anyhow!("agent call timed out")))?
        .ok_or_else(|| Error::Other(anyhow::anyhow!("agent session closed mid-call")))?;

        if reply.get("type").and_then(Value::as_str) == Some("error") {
            let message = reply
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("agent error");
            return Err(Error::Other(anyhow::anyhow!("agent error: {message}")));
        }
        Ok(reply)
    }

    async fn detach(self) {
        self.manager
            .hub
            .unregister_client(self.sandbox_id, self.session_id)
            .await;
    }
}

fn exec_outcome(reply: &Value) -> (String, String, i64) {
    (
        reply
            .get("stdout")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        reply
            .get("stderr")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        reply.get("exitCode").and_then(Value::as_i64).unwrap_or(-1),
    )
}

impl SandboxManager {
    /// Run one code snippet in a fresh sandbox and tear it down afterwards,
    /// success or not.
    pub async fn execute(
        &self,
        identity: &KeyIdentity,
        language: &str,
        code: &str,
        timeout_secs: Option<u64>,
        tier: Tier,
    ) -> Result<ExecuteResponse> {
        let language = Language::parse(language)
            .ok_or_else(|| Error::InvalidInput(format!("unsupported language: {language}")))?;
        let deadline = Duration::from_secs(
            timeout_secs
                .unwrap_or(DEFAULT_TIMEOUT_SECS)
                .clamp(1, MAX_TIMEOUT_SECS),
        );

        // Self-created and short-lived: clients of this sandbox skip auth.
        let created = self.create(identity, tier, true).await?;
        let sandbox_id = created.sandbox_id;

        let result = self.run_snippet(sandbox_id, language, code, deadline).await;

        if let Err(e) = self.destroy(sandbox_id).await {
            warn!(sandbox_id = %sandbox_id, "execute-path sandbox teardown failed: {e}");
        }
        result
    }

    async fn run_snippet(
        &self,
        sandbox_id: Uuid,
        language: Language,
        code: &str,
        deadline: Duration,
    ) -> Result<ExecuteResponse> {
        if !self.hub.wait_for_agent(sandbox_id, AGENT_BOOT_WAIT).await {
            return Err(Error::Other(anyhow::anyhow!(
                "sandbox agent did not connect"
            )));
        }

        let mut client = ExecClient::attach(self, sandbox_id).await;
        let result = Self::drive_agent(&mut client, language, code, deadline).await;
        client.detach().await;
        result
    }

    async fn drive_agent(
        client: &mut ExecClient,
        language: Language,
        code: &str,
        deadline: Duration,
    ) -> Result<ExecuteResponse> {
        client
            .call(
                json!({
                    "type": "write",
                    "path": language.source_file(),
                    "content": code,
                }),
                deadline,
            )
            .await?;

        let compile_result = match language.compile_command() {
            Some((cmd, args)) => {
                let reply = client
                    .call(
                        json!({
                            "type": "exec",
                            "cmd": cmd,
                            "args": args,
                            "timeoutMs": deadline.as_millis() as u64,
                        }),
                        deadline,
                    )
                    .await?;
                let (stdout, stderr, exit_code) = exec_outcome(&reply);
                let compile = CompileResult {
                    stdout,
                    stderr,
                    exit_code,
                };
                if exit_code != 0 {
                    return Ok(ExecuteResponse {
                        success: false,
                        stdout: String::new(),
                        stderr: compile.stderr.clone(),
                        exit_code,
                        compile_result: Some(compile),
                    });
                }
                Some(compile)
            }
            None => None,
        };

        let (cmd, args) = language.run_command();
        let reply = client
            .call(
                json!({
                    "type": "exec",
                    "cmd": cmd,
                    "args": args,
                    "timeoutMs": deadline.as_millis() as u64,
                }),
                deadline,
            )
            .await?;
        let (stdout, stderr, exit_code) = exec_outcome(&reply);

        Ok(ExecuteResponse {
            success: exit_code == 0,
            stdout,
            stderr,
            exit_code,
            compile_result,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_language_set_is_closed() {
        assert_eq!(Language::parse("python"), Some(Language::Python));
        assert_eq!(Language::parse("cpp"), Some(Language::Cpp));
        assert_eq!(Language::parse("ruby"), None);
        assert_eq!(Language::parse("Python"), None);
    }

    #[test]
    fn compiled_languages_carry_a_compile_step() {
        for lang in [Language::Java, Language::Cpp, Language::C, Language::Rust] {
            assert!(lang.compile_command().is_some(), "{lang:?}");
        }
        for lang in [
            Language::JavaScript,
            Language::TypeScript,
            Language::Python,
            Language::Go,
        ] {
            assert!(lang.compile_command().is_none(), "{lang:?}");
        }
    }

    #[test]
    fn java_names_follow_the_entry_class() {
        assert_eq!(Language::Java.source_file(), "Main.java");
        let (cmd, args) = Language::Java.run_command();
        assert_eq!(cmd, "java");
        assert_eq!(args, vec!["Main"]);
    }

    #[test]
    fn cpp_compiles_with_cxx17() {
        let (cmd, args) = Language::Cpp.compile_command().unwrap();
        assert_eq!(cmd, "g++");
        assert!(args.contains(&"-std=c++17"));
        assert_eq!(Language::Cpp.run_command().0, "./main");
    }

    #[test]
    fn exec_outcome_defaults_on_missing_fields() {
        let reply = json!({"id": "1", "type": "execResponse", "stdout": "hi\n"});
        let (stdout, stderr, exit_code) = exec_outcome(&reply);
        assert_eq!(stdout, "hi\n");
        assert_eq!(stderr, "");
        assert_eq!(exit_code, -1);
    }
}
