//! A scripted SMTP provider on a loopback port.
//!
//! Replies are fixed per command and every line the relay sends is recorded,
//! so tests can check what reached the provider.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
};

/// What the provider saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderCommand {
    Ehlo(String),
    /// Mechanism and the raw initial response.
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Everything between DATA and the final dot, still dot-stuffed.
    Message(Vec<u8>),
    Noop,
    Rset,
    Quit,
    Other(String),
}

#[derive(Clone)]
struct Script {
    greeting: (u16, String),
    capabilities: Vec<String>,
    auth: (u16, String),
    mail_from: (u16, String),
    rcpt_to: (u16, String),
    data_end: (u16, String),
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: (220, "mock.provider ESMTP".to_string()),
            capabilities: vec![
                "mock.provider".to_string(),
                "SIZE 10000000".to_string(),
                "AUTH PLAIN LOGIN XOAUTH2".to_string(),
            ],
            auth: (235, "2.7.0 Authentication successful".to_string()),
            mail_from: (250, "2.1.0 OK".to_string()),
            rcpt_to: (250, "2.1.5 OK".to_string()),
            data_end: (250, "2.0.0 Queued".to_string()),
        }
    }
}

fn reply(code: u16, text: &str) -> Vec<u8> {
    format!("{code} {text}\r\n").into_bytes()
}

pub struct MockProvider {
    addr: SocketAddr,
    commands: Arc<RwLock<Vec<ProviderCommand>>>,
    stopped: Arc<AtomicBool>,
}

impl MockProvider {
    pub fn builder() -> MockProviderBuilder {
        MockProviderBuilder::default()
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn commands(&self) -> Vec<ProviderCommand> {
        self.commands.read().await.clone()
    }

    pub async fn messages(&self) -> Vec<Vec<u8>> {
        self.commands()
            .await
            .into_iter()
            .filter_map(|command| match command {
                ProviderCommand::Message(body) => Some(body),
                _ => None,
            })
            .collect()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    async fn serve(
        stream: TcpStream,
        script: Arc<Script>,
        commands: Arc<RwLock<Vec<ProviderCommand>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        writer.write_all(&reply(script.greeting.0, &script.greeting.1)).await?;

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Ok(());
            }

            let command_line = line.trim_end();
            let (verb, rest) = command_line
                .split_once(' ')
                .unwrap_or((command_line, ""));

            let (command, response) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => {
                    let last = script.capabilities.len().saturating_sub(1);
                    let lines: String = script
                        .capabilities
                        .iter()
                        .enumerate()
                        .map(|(i, cap)| format!("250{}{cap}\r\n", if i == last { ' ' } else { '-' }))
                        .collect();
                    (ProviderCommand::Ehlo(rest.to_string()), lines.into_bytes())
                }
                "AUTH" => (
                    ProviderCommand::Auth(rest.to_string()),
                    reply(script.auth.0, &script.auth.1),
                ),
                "MAIL" => (
                    ProviderCommand::MailFrom(rest.to_string()),
                    reply(script.mail_from.0, &script.mail_from.1),
                ),
                "RCPT" => (
                    ProviderCommand::RcptTo(rest.to_string()),
                    reply(script.rcpt_to.0, &script.rcpt_to.1),
                ),
                "DATA" => (ProviderCommand::Data, reply(354, "End data with <CR><LF>.<CR><LF>")),
                "NOOP" => (ProviderCommand::Noop, reply(250, "2.0.0 OK")),
                "RSET" => (ProviderCommand::Rset, reply(250, "2.0.0 OK")),
                "QUIT" => {
                    commands.write().await.push(ProviderCommand::Quit);
                    writer.write_all(&reply(221, "2.0.0 Bye")).await?;
                    return Ok(());
                }
                _ => (
                    ProviderCommand::Other(command_line.to_string()),
                    reply(502, "5.5.2 Command not implemented"),
                ),
            };

            let is_data = command == ProviderCommand::Data;
            commands.write().await.push(command);
            writer.write_all(&response).await?;

            if is_data {
                let mut message = Vec::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line == ".\r\n" {
                        break;
                    }
                    message.extend_from_slice(line.as_bytes());
                }

                commands.write().await.push(ProviderCommand::Message(message));
                writer
                    .write_all(&reply(script.data_end.0, &script.data_end.1))
                    .await?;
            }
        }
    }
}

#[derive(Default)]
pub struct MockProviderBuilder {
    script: Script,
}

impl MockProviderBuilder {
    #[must_use]
    pub fn with_auth_response(mut self, code: u16, text: &str) -> Self {
        self.script.auth = (code, text.to_string());
        self
    }

    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, text: &str) -> Self {
        self.script.rcpt_to = (code, text.to_string());
        self
    }

    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, text: &str) -> Self {
        self.script.data_end = (code, text.to_string());
        self
    }

    pub async fn build(self) -> std::io::Result<MockProvider> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands = Arc::new(RwLock::new(Vec::new()));
        let stopped = Arc::new(AtomicBool::new(false));

        let accept_commands = Arc::clone(&commands);
        let accept_stopped = Arc::clone(&stopped);
        tokio::spawn(async move {
            while !accept_stopped.load(Ordering::Relaxed) {
                // Wake up now and then to notice `stop`
                let Ok(Ok((stream, _))) =
                    tokio::time::timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                let script = Arc::clone(&script);
                let commands = Arc::clone(&accept_commands);
                tokio::spawn(async move {
                    if let Err(err) = MockProvider::serve(stream, script, commands).await {
                        tether_common::tracing::debug!("Mock provider connection error: {err}");
                    }
                });
            }
        });

        Ok(MockProvider {
            addr,
            commands,
            stopped,
        })
    }
}
