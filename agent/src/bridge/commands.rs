//! Slash-command surface of the bridge.
//!
//! Everything an operator can do without a phone: manage sessions, inspect
//! usage, clear a wedged worker. Non-slash text never reaches this module.

use super::Bridge;

const HELP: &str = "\
tether commands:
/new [name] [dir]   create a session (directory must be allow-listed)
/switch <id|name>   make a session active
/list               list sessions
/close [id]         close a session (default: active)
/rename <name>      rename the active session
/session            usage details for the active session
/status             agent status
/stop               force-stop the active worker and clear the queue
/restart            restart the active worker and clear the queue

Anything else is sent to the active session.";

impl Bridge {
    /// Execute one `/command` line and return the operator-facing replies.
    pub(crate) async fn handle_command(&self, line: &str) -> Vec<String> {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or("");
        let args: Vec<&str> = parts.collect();

        match command {
            "/start" => vec![HELP.to_string()],
            "/new" => self.cmd_new(&args).await,
            "/switch" => match args.first() {
                Some(target) => match self.mux().switch(target).await {
                    Ok((id, name)) => {
                        // The busy queue belongs to the session it was
                        // accepted for; it does not follow the operator.
                        let dropped = self.clear_queue().await;
                        if dropped > 0 {
                            vec![format!(
                                "switched to session {id} ({name}), {dropped} queued message(s) dropped"
                            )]
                        } else {
                            vec![format!("switched to session {id} ({name})")]
                        }
                    }
                    Err(e) => vec![format!("error: {e}")],
                },
                None => vec!["usage: /switch <id|name>".to_string()],
            },
            "/list" => self.cmd_list().await,
            "/close" => {
                let id = match args.first() {
                    Some(raw) => match raw.parse::<u64>() {
                        Ok(id) => Some(id),
                        Err(_) => return vec!["usage: /close [id]".to_string()],
                    },
                    None => None,
                };
                match self.mux().close(id).await {
                    Ok((id, name)) => vec![format!("closed session {id} ({name})")],
                    Err(e) => vec![format!("error: {e}")],
                }
            }
            "/rename" => match args.first() {
                Some(name) => match self.mux().rename(name).await {
                    Ok((id, name)) => vec![format!("session {id} renamed to {name}")],
                    Err(e) => vec![format!("error: {e}")],
                },
                None => vec!["usage: /rename <name>".to_string()],
            },
            "/session" => self.cmd_session().await,
            "/status" => self.cmd_status().await,
            "/stop" => match self.mux().force_stop_active().await {
                Ok(id) => {
                    let dropped = self.clear_queue().await;
                    vec![format!("session {id} stopped, {dropped} queued message(s) dropped")]
                }
                Err(e) => vec![format!("error: {e}")],
            },
            "/restart" => match self.mux().restart_active().await {
                Ok(id) => {
                    let dropped = self.clear_queue().await;
                    vec![format!("session {id} restarted, {dropped} queued message(s) dropped")]
                }
                Err(e) => vec![format!("error: {e}")],
            },
            _ => vec![format!("Unknown command: {command} — /start for help")],
        }
    }

    async fn cmd_new(&self, args: &[&str]) -> Vec<String> {
        let name = args.first().copied();
        let dir = args.get(1).copied();
        match self.mux().create(name, dir).await {
            Ok(info) => vec![format!(
                "session {} ({}) created in {}",
                info.id, info.name, info.working_directory
            )],
            Err(e) => vec![format!("error: {e}")],
        }
    }

    async fn cmd_list(&self) -> Vec<String> {
        let sessions = self.mux().list().await;
        if sessions.is_empty() {
            return vec!["no sessions — /new to create one".to_string()];
        }
        let mut lines = Vec::with_capacity(sessions.len());
        for s in sessions {
            let marker = if s.is_active { "*" } else { " " };
            lines.push(format!(
                "{}{} {} [{}] {} — {} msg(s), {} min",
                marker,
                s.id,
                s.name,
                s.status.as_str(),
                s.working_directory,
                s.message_count,
                s.running_minutes,
            ));
        }
        vec![lines.join("\n")]
    }

    async fn cmd_session(&self) -> Vec<String> {
        match self.mux().active_usage().await {
            Ok((name, usage)) => {
                let model = usage.model.as_deref().unwrap_or("unknown");
                let provider = usage.provider_session_id.as_deref().unwrap_or("none");
                vec![format!(
                    "session: {name}\nmodel: {model}\nprovider session: {provider}\n\
                     messages: {}\ntokens: {} in / {} out\ncost: ${:.4}",
                    usage.message_count, usage.input_tokens, usage.output_tokens, usage.cost_usd
                )]
            }
            Err(e) => vec![format!("error: {e}")],
        }
    }

    async fn cmd_status(&self) -> Vec<String> {
        let sessions = self.mux().list().await;
        let active = self.mux().active().await;
        let queued = self.queue_len().await;
        let active_line = match active {
            Some((id, name)) => format!("active: {id} ({name})"),
            None => "active: none".to_string(),
        };
        vec![format!(
            "sessions: {}\n{active_line}\nqueued messages: {queued}",
            sessions.len()
        )]
    }
}
