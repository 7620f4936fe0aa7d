use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use skilltest_core::{CodeFragment, FragmentOutcome, FragmentResult, HarnessConfig, Language};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// What the remote backend said about one fragment. `success: false` means the
/// code ran and errored; backend unreachability is a separate channel
/// (`BackendUnavailable`) so callers can tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReply {
    pub success: bool,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl BackendReply {
    #[must_use]
    pub fn ok(output: &str) -> Self {
        Self {
            success: true,
            output: Some(output.to_string()),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: &str) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendUnavailable {
    #[error("execution backend timed out after {0} ms")]
    Timeout(u64),
    #[error("execution backend unreachable: {0}")]
    Transport(String),
}

pub trait ExecutionBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    /// Acquire a transient remote workspace (e.g. a temporary schema) for a
    /// batch of fragments. Callers release it through [`ScratchSession`].
    fn open_scratch(&self, skill_name: &str) -> Result<String>;

    fn release_scratch(&self, scratch_id: &str) -> Result<()>;

    fn execute(
        &self,
        language: Language,
        code: &str,
        scratch_id: Option<&str>,
        timeout: Duration,
    ) -> Result<BackendReply, BackendUnavailable>;
}

/// Scoped scratch acquisition: released on every exit path. `close` reports
/// release errors on the happy path; `Drop` covers early returns and panics
/// with a best-effort release.
pub struct ScratchSession<'a> {
    backend: &'a dyn ExecutionBackend,
    scratch_id: Option<String>,
    released: bool,
}

impl<'a> ScratchSession<'a> {
    pub fn open(backend: &'a dyn ExecutionBackend, skill_name: &str) -> Self {
        let scratch_id = match backend.open_scratch(skill_name) {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(backend = backend.backend_name(), %err, "scratch unavailable, executing without one");
                None
            }
        };
        Self {
            backend,
            scratch_id,
            released: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.scratch_id.as_deref()
    }

    pub fn close(mut self) -> Result<()> {
        self.released = true;
        match self.scratch_id.take() {
            Some(id) => self.backend.release_scratch(&id),
            None => Ok(()),
        }
    }
}

impl Drop for ScratchSession<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(id) = self.scratch_id.take() {
            let _ = self.backend.release_scratch(&id);
        }
    }
}

pub struct ExecutionAdapter {
    backend: Box<dyn ExecutionBackend>,
    timeout: Duration,
}

impl ExecutionAdapter {
    #[must_use]
    pub fn new(backend: Box<dyn ExecutionBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn from_config(config: &HarnessConfig) -> Result<Self> {
        let timeout = Duration::from_millis(config.execution_timeout_ms);
        let backend: Box<dyn ExecutionBackend> = match &config.execution_endpoint {
            Some(endpoint) => Box::new(HttpExecutionBackend::new(
                endpoint,
                config.bearer_token()?,
            )?),
            None => Box::new(LocalOnlyBackend),
        };
        Ok(Self::new(backend, timeout))
    }

    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Run every fragment in order under one scratch session. A fragment's
    /// failure never stops later fragments; all failures come back as values.
    pub fn execute_all(&self, skill_name: &str, fragments: &[CodeFragment]) -> Vec<FragmentResult> {
        if fragments.is_empty() {
            return Vec::new();
        }
        let session = ScratchSession::open(self.backend.as_ref(), skill_name);
        let results = fragments
            .iter()
            .map(|fragment| self.execute_fragment(fragment, session.id()))
            .collect();
        if let Err(err) = session.close() {
            warn!(%err, "scratch release failed");
        }
        results
    }

    fn execute_fragment(&self, fragment: &CodeFragment, scratch_id: Option<&str>) -> FragmentResult {
        debug!(
            language = fragment.language.as_str(),
            line = fragment.line,
            "executing fragment"
        );
        match self
            .backend
            .execute(fragment.language, &fragment.code, scratch_id, self.timeout)
        {
            Ok(reply) if reply.success => FragmentResult {
                language: fragment.language,
                line: fragment.line,
                outcome: FragmentOutcome::Passed,
                output: reply.output,
                error: None,
                detail: None,
            },
            Ok(reply) => FragmentResult {
                language: fragment.language,
                line: fragment.line,
                outcome: FragmentOutcome::Failed,
                output: reply.output,
                error: reply.error.or_else(|| Some("execution failed".to_string())),
                detail: None,
            },
            Err(unavailable) => {
                let detail = match local_syntax_check(fragment.language, &fragment.code) {
                    Ok(()) => "local syntax check passed".to_string(),
                    Err(reason) => format!("local syntax check failed: {reason}"),
                };
                FragmentResult {
                    language: fragment.language,
                    line: fragment.line,
                    outcome: FragmentOutcome::Degraded,
                    output: None,
                    error: Some(unavailable.to_string()),
                    detail: Some(detail),
                }
            }
        }
    }
}

/// Stands in when no execution endpoint is configured: every fragment comes
/// back degraded with only the local syntax verdict attached.
pub struct LocalOnlyBackend;

impl ExecutionBackend for LocalOnlyBackend {
    fn backend_name(&self) -> &'static str {
        "local_only"
    }

    fn open_scratch(&self, _skill_name: &str) -> Result<String> {
        Err(anyhow!("no execution endpoint configured"))
    }

    fn release_scratch(&self, _scratch_id: &str) -> Result<()> {
        Ok(())
    }

    fn execute(
        &self,
        _language: Language,
        _code: &str,
        _scratch_id: Option<&str>,
        _timeout: Duration,
    ) -> Result<BackendReply, BackendUnavailable> {
        Err(BackendUnavailable::Transport(
            "no execution endpoint configured".to_string(),
        ))
    }
}

pub struct HttpExecutionBackend {
    base_url: String,
    client: reqwest::blocking::Client,
    bearer: Option<String>,
}

impl HttpExecutionBackend {
    pub fn new(base_url: &str, bearer: Option<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder().build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            bearer,
        })
    }

    fn post(&self, path: &str) -> reqwest::blocking::RequestBuilder {
        let mut builder = self.client.post(format!("{}{path}", self.base_url));
        if let Some(token) = &self.bearer {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

impl ExecutionBackend for HttpExecutionBackend {
    fn backend_name(&self) -> &'static str {
        "http"
    }

    fn open_scratch(&self, skill_name: &str) -> Result<String> {
        let response = self
            .post("/scratch")
            .timeout(Duration::from_secs(10))
            .json(&json!({ "skill": skill_name }))
            .send()?;
        let body: Value = response.json()?;
        body.get("scratch_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("scratch reply missing scratch_id"))
    }

    fn release_scratch(&self, scratch_id: &str) -> Result<()> {
        self.post("/scratch/release")
            .timeout(Duration::from_secs(10))
            .json(&json!({ "scratch_id": scratch_id }))
            .send()?;
        Ok(())
    }

    fn execute(
        &self,
        language: Language,
        code: &str,
        scratch_id: Option<&str>,
        timeout: Duration,
    ) -> Result<BackendReply, BackendUnavailable> {
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let body = json!({
            "language": language.as_str(),
            "code": code,
            "timeout_ms": timeout_ms,
            "scratch": scratch_id,
        });

        let response = self
            .post("/execute")
            .timeout(timeout)
            .json(&body)
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    BackendUnavailable::Timeout(timeout_ms)
                } else {
                    BackendUnavailable::Transport(err.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .map_err(|err| BackendUnavailable::Transport(err.to_string()))?;

        // The backend is unreliable: tolerate partial or garbled bodies by
        // folding them into a failed reply instead of propagating.
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => match value.get("success").and_then(Value::as_bool) {
                Some(success) => Ok(BackendReply {
                    success,
                    output: value
                        .get("output")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    error: value
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }),
                None => Ok(BackendReply::failed(&format!(
                    "unrecognized backend reply (http {status}): {}",
                    clip(&text)
                ))),
            },
            Err(_) => Ok(BackendReply::failed(&format!(
                "non-JSON backend reply (http {status}): {}",
                clip(&text)
            ))),
        }
    }
}

fn clip(text: &str) -> String {
    const MAX: usize = 200;
    if text.len() <= MAX {
        text.to_string()
    } else {
        let mut end = MAX;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    }
}

const SQL_LEADING_KEYWORDS: &[&str] = &[
    "SELECT", "CREATE", "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "WITH", "SHOW", "DESCRIBE",
    "DESC", "USE", "MERGE", "GRANT", "REVOKE", "COPY", "SET", "EXPLAIN", "VACUUM", "OPTIMIZE",
    "REFRESH", "TRUNCATE",
];

const PYTHON_BLOCK_KEYWORDS: &[&str] = &[
    "def", "class", "if", "elif", "else", "for", "while", "try", "except", "finally", "with",
];

/// Static syntax-only validation used when the backend cannot run the code.
/// Deliberately shallow: delimiter balance, string termination, and a leading
/// statement-keyword check per language.
pub fn local_syntax_check(language: Language, code: &str) -> Result<(), String> {
    if code.trim().is_empty() {
        return Err("empty fragment".to_string());
    }
    match language {
        Language::Sql => check_sql(code),
        Language::Python => check_python(code),
    }
}

fn check_sql(code: &str) -> Result<(), String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string: Option<char> = None;

    for line in code.lines() {
        let mut chars = line.chars().peekable();
        while let Some(c) = chars.next() {
            if let Some(quote) = in_string {
                if c == quote {
                    // Doubled quote is an escape.
                    if chars.peek() == Some(&quote) {
                        chars.next();
                    } else {
                        in_string = None;
                    }
                }
                continue;
            }
            match c {
                '\'' | '"' => in_string = Some(c),
                '-' if chars.peek() == Some(&'-') => break,
                '(' => stack.push(')'),
                ')' => {
                    if stack.pop() != Some(')') {
                        return Err("unbalanced ')'".to_string());
                    }
                }
                _ => {}
            }
        }
        // SQL string literals may span lines.
    }

    if in_string.is_some() {
        return Err("unterminated string literal".to_string());
    }
    if !stack.is_empty() {
        return Err("unbalanced '('".to_string());
    }

    let first_token = code
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("--"))
        .and_then(|line| line.split_whitespace().next())
        .unwrap_or("");
    let keyword = first_token.to_ascii_uppercase();
    if !SQL_LEADING_KEYWORDS.contains(&keyword.as_str()) {
        return Err(format!("'{first_token}' is not a SQL statement keyword"));
    }
    Ok(())
}

fn check_python(code: &str) -> Result<(), String> {
    let mut stack: Vec<char> = Vec::new();
    let mut triple: Option<&'static str> = None;

    let lines: Vec<&str> = code.lines().collect();
    let mut block_headers: Vec<usize> = Vec::new();

    for (idx, line) in lines.iter().enumerate() {
        let mut rest = *line;
        if let Some(marker) = triple {
            match rest.find(marker) {
                Some(pos) => {
                    triple = None;
                    rest = &rest[pos + 3..];
                }
                None => continue,
            }
        }

        let mut in_string: Option<char> = None;
        let mut bytes = rest.char_indices().peekable();
        let mut line_ends_with_colon = false;
        while let Some((pos, c)) = bytes.next() {
            if let Some(quote) = in_string {
                if c == '\\' {
                    bytes.next();
                } else if c == quote {
                    in_string = None;
                }
                continue;
            }
            match c {
                '\'' | '"' => {
                    let marker: &'static str = if c == '\'' { "'''" } else { "\"\"\"" };
                    if rest[pos..].starts_with(marker) {
                        match rest[pos + 3..].find(marker) {
                            Some(close) => {
                                // Single-line triple-quoted string.
                                let skip_to = pos + 3 + close + 3;
                                while bytes.peek().is_some_and(|(p, _)| *p < skip_to) {
                                    bytes.next();
                                }
                            }
                            None => {
                                triple = Some(marker);
                                break;
                            }
                        }
                    } else {
                        in_string = Some(c);
                    }
                }
                '#' => break,
                '(' => stack.push(')'),
                '[' => stack.push(']'),
                '{' => stack.push('}'),
                ')' | ']' | '}' => {
                    if stack.pop() != Some(c) {
                        return Err(format!("unbalanced '{c}'"));
                    }
                }
                ':' if bytes.peek().is_none() => line_ends_with_colon = true,
                _ => {}
            }
        }
        if in_string.is_some() {
            return Err("unterminated string literal".to_string());
        }
        let trimmed = line.trim_start();
        let leading_word = trimmed.split(|c: char| !c.is_alphanumeric() && c != '_')
            .next()
            .unwrap_or("");
        if line_ends_with_colon && stack.is_empty() && PYTHON_BLOCK_KEYWORDS.contains(&leading_word)
        {
            block_headers.push(idx);
        }
    }

    if triple.is_some() {
        return Err("unterminated triple-quoted string".to_string());
    }
    if !stack.is_empty() {
        return Err("unbalanced bracket".to_string());
    }

    for header in block_headers {
        let header_indent = indent_width(lines[header]);
        let body = lines[header + 1..]
            .iter()
            .find(|line| !line.trim().is_empty());
        match body {
            Some(line) if indent_width(line) > header_indent => {}
            _ => {
                return Err(format!(
                    "block at line {} has no indented body",
                    header + 1
                ));
            }
        }
    }
    Ok(())
}

fn indent_width(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ' || *c == '\t').count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::Read;
    use std::sync::{Arc, Mutex};
    use std::thread;

    #[derive(Clone)]
    enum Scripted {
        Reply(BackendReply),
        Unreachable(String),
    }

    #[derive(Clone, Default)]
    struct ScriptedBackend {
        replies: Arc<Mutex<VecDeque<Scripted>>>,
        opened: Arc<Mutex<Vec<String>>>,
        released: Arc<Mutex<Vec<String>>>,
        scratch_fails: bool,
    }

    impl ScriptedBackend {
        fn push(&self, entry: Scripted) {
            self.replies.lock().expect("replies").push_back(entry);
        }
    }

    impl ExecutionBackend for ScriptedBackend {
        fn backend_name(&self) -> &'static str {
            "scripted"
        }

        fn open_scratch(&self, skill_name: &str) -> Result<String> {
            if self.scratch_fails {
                return Err(anyhow!("scratch refused"));
            }
            let id = format!("scratch_{skill_name}");
            self.opened.lock().expect("opened").push(id.clone());
            Ok(id)
        }

        fn release_scratch(&self, scratch_id: &str) -> Result<()> {
            self.released
                .lock()
                .expect("released")
                .push(scratch_id.to_string());
            Ok(())
        }

        fn execute(
            &self,
            _language: Language,
            code: &str,
            _scratch_id: Option<&str>,
            _timeout: Duration,
        ) -> Result<BackendReply, BackendUnavailable> {
            match self.replies.lock().expect("replies").pop_front() {
                Some(Scripted::Reply(reply)) => Ok(reply),
                Some(Scripted::Unreachable(reason)) => Err(BackendUnavailable::Transport(reason)),
                None => Ok(BackendReply::ok(code.trim())),
            }
        }
    }

    fn fragment(language: Language, line: usize, code: &str) -> CodeFragment {
        CodeFragment {
            language,
            line,
            code: code.to_string(),
        }
    }

    #[test]
    fn sql_check_accepts_statements_and_rejects_prose() {
        local_syntax_check(Language::Sql, "SELECT 1;").expect("select");
        local_syntax_check(Language::Sql, "-- note\nCREATE TABLE t (id INT);").expect("create");
        let err = local_syntax_check(Language::Sql, "hello world").expect_err("prose");
        assert!(err.contains("not a SQL statement keyword"), "{err}");
        let err = local_syntax_check(Language::Sql, "SELECT (1;").expect_err("unbalanced");
        assert!(err.contains("unbalanced"), "{err}");
        let err = local_syntax_check(Language::Sql, "SELECT 'abc").expect_err("open string");
        assert!(err.contains("unterminated"), "{err}");
        local_syntax_check(Language::Sql, "SELECT 'it''s fine';").expect("doubled quote escape");
    }

    #[test]
    fn python_check_catches_structural_problems() {
        local_syntax_check(Language::Python, "x = 1\nprint(x)").expect("plain");
        local_syntax_check(Language::Python, "def f():\n    return 1").expect("block with body");
        local_syntax_check(Language::Python, "s = \"\"\"multi\nline\"\"\"").expect("triple quote");
        let err = local_syntax_check(Language::Python, "x = 'open").expect_err("open string");
        assert!(err.contains("unterminated"), "{err}");
        let err = local_syntax_check(Language::Python, "def f():\nreturn 1").expect_err("no body");
        assert!(err.contains("no indented body"), "{err}");
        let err = local_syntax_check(Language::Python, "x = (1\n").expect_err("open paren");
        assert!(err.contains("unbalanced"), "{err}");
        let err = local_syntax_check(Language::Python, "   \n").expect_err("empty");
        assert!(err.contains("empty"), "{err}");
    }

    #[test]
    fn one_failed_fragment_does_not_stop_the_rest() {
        let backend = ScriptedBackend::default();
        backend.push(Scripted::Reply(BackendReply::failed("boom")));
        backend.push(Scripted::Reply(BackendReply::ok("[{\"1\": 1}]")));
        let adapter = ExecutionAdapter::new(Box::new(backend.clone()), Duration::from_secs(5));

        let results = adapter.execute_all(
            "demo",
            &[
                fragment(Language::Sql, 1, "SELECT broken;"),
                fragment(Language::Sql, 5, "SELECT 1;"),
            ],
        );

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].outcome, FragmentOutcome::Failed);
        assert_eq!(results[0].error.as_deref(), Some("boom"));
        assert_eq!(results[1].outcome, FragmentOutcome::Passed);
        assert_eq!(results[1].output.as_deref(), Some("[{\"1\": 1}]"));
    }

    #[test]
    fn unreachable_backend_degrades_with_syntax_verdict() {
        let backend = ScriptedBackend::default();
        backend.push(Scripted::Unreachable("connection refused".to_string()));
        backend.push(Scripted::Unreachable("connection refused".to_string()));
        let adapter = ExecutionAdapter::new(Box::new(backend), Duration::from_secs(5));

        let results = adapter.execute_all(
            "demo",
            &[
                fragment(Language::Sql, 1, "SELECT 1;"),
                fragment(Language::Python, 4, "not python ("),
            ],
        );

        assert_eq!(results[0].outcome, FragmentOutcome::Degraded);
        assert!(results[0]
            .detail
            .as_deref()
            .expect("detail")
            .contains("local syntax check passed"));
        assert_eq!(results[1].outcome, FragmentOutcome::Degraded);
        assert!(results[1]
            .detail
            .as_deref()
            .expect("detail")
            .contains("local syntax check failed"));
        assert!(results[1]
            .error
            .as_deref()
            .expect("error")
            .contains("unreachable"));
    }

    #[test]
    fn scratch_is_released_once_per_batch() {
        let backend = ScriptedBackend::default();
        let adapter = ExecutionAdapter::new(Box::new(backend.clone()), Duration::from_secs(5));

        adapter.execute_all("demo", &[fragment(Language::Sql, 1, "SELECT 1;")]);

        assert_eq!(
            backend.opened.lock().expect("opened").as_slice(),
            ["scratch_demo"]
        );
        assert_eq!(
            backend.released.lock().expect("released").as_slice(),
            ["scratch_demo"]
        );
    }

    #[test]
    fn scratch_session_releases_on_drop() {
        let backend = ScriptedBackend::default();
        {
            let session = ScratchSession::open(&backend, "demo");
            assert_eq!(session.id(), Some("scratch_demo"));
            // Dropped without close().
        }
        assert_eq!(
            backend.released.lock().expect("released").as_slice(),
            ["scratch_demo"]
        );
    }

    #[test]
    fn scratch_failure_executes_without_one() {
        let backend = ScriptedBackend {
            scratch_fails: true,
            ..ScriptedBackend::default()
        };
        let adapter = ExecutionAdapter::new(Box::new(backend.clone()), Duration::from_secs(5));

        let results = adapter.execute_all("demo", &[fragment(Language::Sql, 1, "SELECT 1;")]);
        assert_eq!(results[0].outcome, FragmentOutcome::Passed);
        assert!(backend.released.lock().expect("released").is_empty());
    }

    fn serve_once(body: &'static str) -> String {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind");
        let addr = server.server_addr().to_ip().expect("ip addr");
        thread::spawn(move || {
            if let Ok(mut request) = server.recv() {
                let mut payload = String::new();
                let _ = request.as_reader().read_to_string(&mut payload);
                let _ = request.respond(tiny_http::Response::from_string(body));
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn http_backend_parses_well_formed_reply() {
        let base = serve_once(r#"{"success": true, "output": "[{\"1\": 1}]"}"#);
        let backend = HttpExecutionBackend::new(&base, None).expect("client");
        let reply = backend
            .execute(Language::Sql, "SELECT 1;", None, Duration::from_secs(5))
            .expect("reply");
        assert!(reply.success);
        assert_eq!(reply.output.as_deref(), Some("[{\"1\": 1}]"));
    }

    #[test]
    fn http_backend_folds_garbled_reply_into_failure() {
        let base = serve_once("<html>proxy error</html>");
        let backend = HttpExecutionBackend::new(&base, None).expect("client");
        let reply = backend
            .execute(Language::Sql, "SELECT 1;", None, Duration::from_secs(5))
            .expect("reply");
        assert!(!reply.success);
        assert!(reply
            .error
            .as_deref()
            .expect("error")
            .contains("non-JSON backend reply"));
    }

    #[test]
    fn http_backend_reports_unreachable_as_transport() {
        // Port 9 (discard) is almost certainly closed for HTTP.
        let backend = HttpExecutionBackend::new("http://127.0.0.1:9", None).expect("client");
        let err = backend
            .execute(Language::Sql, "SELECT 1;", None, Duration::from_secs(2))
            .expect_err("unreachable");
        assert!(matches!(err, BackendUnavailable::Transport(_)));
    }
}
