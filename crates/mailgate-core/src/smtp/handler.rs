//! SMTP session handler

use super::auth::{AuthOutcome, SmtpAuthenticator};
use super::policy::DeliveryPolicy;
use crate::delivery::{Ingestor, ParsedMail};
use crate::sasl::{self, SaslError};
use anyhow::Result;
use mailgate_common::config::SmtpConfig;
use mailgate_common::types::EmailAddress;
use mailgate_storage::{Inbox, User};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Longest AUTH response line accepted, in bytes
const MAX_AUTH_LINE: u64 = 12 * 1024;

/// SMTP session state
#[derive(Debug, Clone, Copy, PartialEq)]
enum SessionState {
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
}

/// How a command loop ended
enum SessionEnd<S> {
    Closed,
    StartTls(S),
}

/// Envelope and authentication state of one connection
struct Session {
    state: SessionState,
    helo: Option<String>,
    /// Reverse path; empty for the null sender
    sender: String,
    recipients: Vec<(String, Inbox)>,
    user: Option<User>,
    tls_active: bool,
}

impl Session {
    fn new() -> Self {
        Self {
            state: SessionState::Connected,
            helo: None,
            sender: String::new(),
            recipients: Vec::new(),
            user: None,
            tls_active: false,
        }
    }

    fn reset_envelope(&mut self) {
        self.sender.clear();
        self.recipients.clear();
        if self.state != SessionState::Connected {
            self.state = SessionState::Greeted;
        }
    }
}

/// Message data read after DATA
enum DataOutcome {
    Complete(Vec<u8>),
    TooLarge,
    TimedOut,
}

/// Answer to a 334 challenge
enum ChallengeReply {
    Line(String),
    Closed,
    TimedOut,
}

/// Whether the command loop keeps reading after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Services shared by every session of a listener
#[derive(Clone)]
pub struct SmtpContext {
    pub config: SmtpConfig,
    pub hostname: String,
    pub ingestor: Arc<Ingestor>,
    pub authenticator: Arc<SmtpAuthenticator>,
    pub tls_acceptor: Option<TlsAcceptor>,
}

/// SMTP session handler
pub struct SmtpHandler {
    context: SmtpContext,
    policy: Arc<dyn DeliveryPolicy>,
    peer_addr: SocketAddr,
}

impl SmtpHandler {
    /// Create a new handler
    pub fn new(context: SmtpContext, policy: Arc<dyn DeliveryPolicy>, peer_addr: SocketAddr) -> Self {
        Self {
            context,
            policy,
            peer_addr,
        }
    }

    /// Handle an SMTP session, continuing over TLS after STARTTLS
    pub async fn handle<S>(self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut session = Session::new();

        let greeting = format!("{} ESMTP Mailgate", self.context.hostname);
        write_reply(&mut stream, 220, &greeting).await?;
        stream.flush().await?;

        if let SessionEnd::StartTls(stream) = self.serve(stream, &mut session).await? {
            if let Some(acceptor) = &self.context.tls_acceptor {
                let tls_stream = acceptor.accept(stream).await?;
                debug!(peer = %self.peer_addr, "SMTP connection upgraded to TLS");
                // The client starts over with EHLO
                session = Session::new();
                session.tls_active = true;
                self.serve(tls_stream, &mut session).await?;
            }
        }

        debug!(peer = %self.peer_addr, service = self.policy.name(), "SMTP session ended");
        Ok(())
    }

    /// AUTH is refused on a plaintext connection that could use STARTTLS
    fn auth_allowed(&self, session: &Session) -> bool {
        session.tls_active
            || self.context.tls_acceptor.is_none()
            || self.context.config.allow_insecure_auth
    }

    async fn serve<S>(&self, stream: S, session: &mut Session) -> Result<SessionEnd<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut stream = BufReader::new(stream);
        let read_timeout = Duration::from_secs(self.context.config.read_timeout_secs);
        let mut line = String::new();

        loop {
            line.clear();
            match tokio::time::timeout(read_timeout, stream.read_line(&mut line)).await {
                Ok(Ok(0)) => {
                    debug!(peer = %self.peer_addr, "Client disconnected");
                    return Ok(SessionEnd::Closed);
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    self.timed_out(&mut stream).await?;
                    return Ok(SessionEnd::Closed);
                }
            }

            let (command, args) = parse_command(line.trim());
            let command = command.to_uppercase();
            debug!(peer = %self.peer_addr, command = %command, "SMTP command");

            match command.as_str() {
                "HELO" | "EHLO" => {
                    if args.is_empty() {
                        let message = format!("5.5.4 Syntax: {} hostname", command);
                        self.reply(&mut stream, 501, &message).await?;
                        continue;
                    }
                    session.helo = Some(args.to_string());
                    session.state = SessionState::Greeted;
                    session.reset_envelope();

                    if command == "HELO" {
                        let message = format!("{} Hello {}", self.context.hostname, args);
                        self.reply(&mut stream, 250, &message).await?;
                    } else {
                        let lines = self.ehlo_lines(args, session);
                        self.reply_multiline(&mut stream, 250, &lines).await?;
                    }
                }

                "STARTTLS" => {
                    if self.context.tls_acceptor.is_none() {
                        self.reply(&mut stream, 502, "5.5.1 STARTTLS not supported").await?;
                    } else if session.tls_active {
                        self.reply(&mut stream, 503, "5.5.1 TLS already active").await?;
                    } else {
                        self.reply(&mut stream, 220, "2.0.0 Ready to start TLS").await?;
                        // Anything pipelined after STARTTLS is discarded with the buffer
                        return Ok(SessionEnd::StartTls(stream.into_inner()));
                    }
                }

                "AUTH" => {
                    if self.handle_auth(args, session, &mut stream).await? == Flow::Close {
                        return Ok(SessionEnd::Closed);
                    }
                }

                "MAIL" => {
                    if session.state != SessionState::Greeted {
                        self.reply(&mut stream, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    if self.policy.requires_auth() && session.user.is_none() {
                        self.reply(&mut stream, 530, "5.7.0 Authentication required").await?;
                        continue;
                    }

                    match parse_mail_from(args) {
                        Some(MailFrom { size, .. })
                            if size.is_some_and(|size| size > self.context.config.max_message_size) =>
                        {
                            self.reply(&mut stream, 552, "5.3.4 Message size exceeds fixed limit")
                                .await?;
                        }
                        Some(MailFrom { sender, .. }) => {
                            session.sender = sender.map(|a| a.to_string()).unwrap_or_default();
                            session.state = SessionState::MailFrom;
                            self.reply(&mut stream, 250, "2.1.0 OK").await?;
                        }
                        None => {
                            self.reply(&mut stream, 501, "5.1.7 Bad sender address syntax")
                                .await?;
                        }
                    }
                }

                "RCPT" => {
                    if session.state != SessionState::MailFrom && session.state != SessionState::RcptTo {
                        self.reply(&mut stream, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }
                    let (code, message) = self.handle_rcpt(args, session).await;
                    self.reply(&mut stream, code, message).await?;
                }

                "DATA" => {
                    if session.state != SessionState::RcptTo {
                        self.reply(&mut stream, 503, "5.5.1 Bad sequence of commands").await?;
                        continue;
                    }

                    self.reply(&mut stream, 354, "End data with <CR><LF>.<CR><LF>").await?;
                    let outcome =
                        read_data(&mut stream, self.context.config.max_message_size, read_timeout)
                            .await?;
                    let (code, message) = match outcome {
                        DataOutcome::TimedOut => {
                            self.timed_out(&mut stream).await?;
                            return Ok(SessionEnd::Closed);
                        }
                        DataOutcome::TooLarge => (552, "5.3.4 Message size exceeds fixed limit"),
                        DataOutcome::Complete(data) => self.deliver(session, &data).await,
                    };
                    self.reply(&mut stream, code, message).await?;
                    session.reset_envelope();
                }

                "RSET" => {
                    session.reset_envelope();
                    self.reply(&mut stream, 250, "2.0.0 OK").await?;
                }

                "NOOP" => {
                    self.reply(&mut stream, 250, "2.0.0 OK").await?;
                }

                "QUIT" => {
                    self.reply(&mut stream, 221, "2.0.0 Bye").await?;
                    return Ok(SessionEnd::Closed);
                }

                "VRFY" => {
                    self.reply(&mut stream, 252, "2.5.2 Cannot VRFY user").await?;
                }

                "EXPN" => {
                    self.reply(&mut stream, 502, "5.5.1 EXPN not supported").await?;
                }

                _ => {
                    self.reply(&mut stream, 500, "5.5.2 Command not recognized").await?;
                }
            }
        }
    }

    fn ehlo_lines(&self, client: &str, session: &Session) -> Vec<String> {
        let mut lines = vec![
            format!("{} Hello {}", self.context.hostname, client),
            format!("SIZE {}", self.context.config.max_message_size),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ];

        if self.context.tls_acceptor.is_some() && !session.tls_active {
            lines.push("STARTTLS".to_string());
        }

        if self.policy.offers_auth() && self.auth_allowed(session) {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }

        lines
    }

    async fn handle_auth<T>(&self, args: &str, session: &mut Session, stream: &mut T) -> Result<Flow>
    where
        T: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        let refusal = if !self.policy.offers_auth() {
            Some((502, "5.5.1 AUTH not supported"))
        } else if session.state == SessionState::Connected {
            Some((503, "5.5.1 Bad sequence of commands"))
        } else if session.user.is_some() {
            Some((503, "5.5.1 Already authenticated"))
        } else if !self.auth_allowed(session) {
            Some((538, "5.7.11 Encryption required for requested authentication mechanism"))
        } else {
            None
        };
        if let Some((code, message)) = refusal {
            self.reply(stream, code, message).await?;
            return Ok(Flow::Continue);
        }

        let (mechanism, initial) = parse_command(args);
        let initial = (!initial.is_empty()).then(|| initial.to_string());

        let result = match mechanism.to_uppercase().as_str() {
            "PLAIN" => {
                let response = match initial {
                    Some(response) => response,
                    None => match self.challenge(stream, "").await? {
                        ChallengeReply::Line(response) => response,
                        other => return self.abandon(stream, other).await,
                    },
                };
                self.context.authenticator.authenticate_plain(&response).await
            }
            "LOGIN" => {
                let username = match initial {
                    Some(username) => username,
                    None => {
                        let prompt = sasl::login_challenge_username();
                        match self.challenge(stream, &prompt).await? {
                            ChallengeReply::Line(username) => username,
                            other => return self.abandon(stream, other).await,
                        }
                    }
                };
                if username.trim() == "*" {
                    Err(SaslError::Cancelled)
                } else {
                    let prompt = sasl::login_challenge_password();
                    let token = match self.challenge(stream, &prompt).await? {
                        ChallengeReply::Line(token) => token,
                        other => return self.abandon(stream, other).await,
                    };
                    self.context
                        .authenticator
                        .authenticate_login(&username, &token)
                        .await
                }
            }
            _ => {
                self.reply(stream, 504, "5.5.4 Unrecognized authentication mechanism")
                    .await?;
                return Ok(Flow::Continue);
            }
        };

        let (code, message) = match result {
            Ok(outcome) => {
                let (code, message) = outcome.reply();
                if let AuthOutcome::Success(user) = outcome {
                    info!(peer = %self.peer_addr, user = %user.username, "SMTP authentication successful");
                    session.user = Some(user);
                } else {
                    warn!(peer = %self.peer_addr, code, "SMTP authentication failed");
                }
                (code, message)
            }
            Err(SaslError::Cancelled) => (501, "5.0.0 Authentication cancelled"),
            Err(e) => {
                debug!(peer = %self.peer_addr, error = %e, "Malformed AUTH response");
                (501, "5.5.2 Cannot decode response")
            }
        };
        self.reply(stream, code, message).await?;
        Ok(Flow::Continue)
    }

    /// Send a 334 challenge and read the client's answer
    async fn challenge<T>(&self, stream: &mut T, prompt: &str) -> Result<ChallengeReply>
    where
        T: AsyncBufRead + AsyncWrite + Unpin + Send,
    {
        self.reply(stream, 334, prompt).await?;
        let read_timeout = Duration::from_secs(self.context.config.read_timeout_secs);
        let mut line = String::new();
        let mut limited = (&mut *stream).take(MAX_AUTH_LINE);
        Ok(
            match tokio::time::timeout(read_timeout, limited.read_line(&mut line)).await {
                Ok(Ok(0)) => ChallengeReply::Closed,
                Ok(Ok(_)) => ChallengeReply::Line(line.trim().to_string()),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => ChallengeReply::TimedOut,
            },
        )
    }

    /// End an AUTH exchange the client did not answer
    async fn abandon<T>(&self, stream: &mut T, reply: ChallengeReply) -> Result<Flow>
    where
        T: AsyncWrite + Unpin,
    {
        if let ChallengeReply::TimedOut = reply {
            self.timed_out(stream).await?;
        }
        Ok(Flow::Close)
    }

    /// Tell a silent client the connection is being dropped
    async fn timed_out<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        warn!(peer = %self.peer_addr, "SMTP read timeout");
        let message = format!("4.4.2 {} Error: timeout exceeded", self.context.hostname);
        self.reply(writer, 421, &message).await
    }

    async fn handle_rcpt(&self, args: &str, session: &mut Session) -> (u16, &'static str) {
        let Some(recipient) = parse_rcpt_to(args) else {
            return (501, "5.1.3 Bad recipient address syntax");
        };
        if session.recipients.len() >= self.context.config.max_recipients {
            return (452, "4.5.3 Too many recipients");
        }
        if let Err(rejection) = self.policy.check_recipient(&recipient) {
            debug!(peer = %self.peer_addr, recipient = %recipient, "Recipient rejected by policy");
            return (rejection.code, rejection.message);
        }

        let address = recipient.to_string();
        match self.context.ingestor.resolve_recipient(&address).await {
            Ok(Some(inbox)) => {
                session.recipients.push((address, inbox));
                session.state = SessionState::RcptTo;
                (250, "2.1.5 OK")
            }
            Ok(None) => (550, "5.1.1 User unknown"),
            Err(e) => {
                warn!(recipient = %address, error = %e, "Inbox lookup failed");
                (451, "4.3.0 Temporary lookup failure")
            }
        }
    }

    /// Store the message once per accepted recipient
    async fn deliver(&self, session: &Session, data: &[u8]) -> (u16, &'static str) {
        let mail = match ParsedMail::parse(data) {
            Ok(mail) => mail,
            Err(e) => {
                warn!(peer = %self.peer_addr, error = %e, "Rejecting unparseable message");
                return (554, "5.3.0 Message could not be parsed");
            }
        };

        for (recipient, inbox) in &session.recipients {
            if let Err(e) = self
                .context
                .ingestor
                .store(inbox, &session.sender, recipient, &mail)
                .await
            {
                warn!(recipient = %recipient, error = %e, "Failed to store message");
                return (451, "4.3.0 Temporary error");
            }
        }

        info!(
            peer = %self.peer_addr,
            service = self.policy.name(),
            helo = session.helo.as_deref().unwrap_or_default(),
            recipients = session.recipients.len(),
            size = data.len(),
            "Message accepted"
        );
        (250, "2.0.0 OK")
    }

    /// Send an SMTP response
    async fn reply<W>(&self, writer: &mut W, code: u16, message: &str) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        write_reply(writer, code, message).await?;
        writer.flush().await?;
        debug!(peer = %self.peer_addr, code, "SMTP reply");
        Ok(())
    }

    /// Send a multi-line response
    async fn reply_multiline<W>(&self, writer: &mut W, code: u16, lines: &[String]) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut response = String::new();
        for (i, line) in lines.iter().enumerate() {
            let separator = if i + 1 == lines.len() { ' ' } else { '-' };
            response.push_str(&format!("{}{}{}\r\n", code, separator, line));
        }
        writer.write_all(response.as_bytes()).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn write_reply<W>(writer: &mut W, code: u16, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer
        .write_all(format!("{} {}\r\n", code, message).as_bytes())
        .await?;
    Ok(())
}

/// Read message data until <CRLF>.<CRLF>, removing dot-stuffing. Data past
/// the size limit is read and discarded so the session stays in sync. No
/// single read buffers more than the limit, and each read waits at most
/// `read_timeout`.
async fn read_data<R>(reader: &mut R, max_size: usize, read_timeout: Duration) -> Result<DataOutcome>
where
    R: AsyncBufRead + Unpin,
{
    // Room for a leading stuffed dot and the line ending
    let chunk_limit = u64::try_from(max_size).unwrap_or(u64::MAX).saturating_add(3);
    let mut data = Vec::new();
    let mut line = Vec::new();
    let mut too_large = false;
    let mut line_start = true;

    loop {
        line.clear();
        let mut limited = (&mut *reader).take(chunk_limit);
        let read = match tokio::time::timeout(read_timeout, limited.read_until(b'\n', &mut line)).await {
            Ok(read) => read?,
            Err(_) => return Ok(DataOutcome::TimedOut),
        };
        if read == 0 {
            return Err(anyhow::anyhow!("Connection closed during DATA"));
        }

        // An overlong line arrives in several chunks; only the first one
        // can be the terminator or carry a stuffed dot
        if line_start && (line == b".\r\n" || line == b".\n") {
            break;
        }

        let content = if line_start {
            line.strip_prefix(b".").unwrap_or(&line[..])
        } else {
            &line[..]
        };
        if data.len() + content.len() > max_size {
            too_large = true;
        }
        if !too_large {
            data.extend_from_slice(content);
        }
        line_start = line.ends_with(b"\n");
    }

    Ok(if too_large {
        DataOutcome::TooLarge
    } else {
        DataOutcome::Complete(data)
    })
}

/// Parse an SMTP command line into command and arguments
fn parse_command(line: &str) -> (&str, &str) {
    match line.split_once(' ') {
        Some((command, args)) => (command, args.trim()),
        None => (line, ""),
    }
}

/// Parsed MAIL FROM arguments
#[derive(Debug, PartialEq)]
struct MailFrom {
    /// `None` for the null sender `<>`
    sender: Option<EmailAddress>,
    size: Option<usize>,
}

/// Parse MAIL FROM:<address> [SIZE=n]
fn parse_mail_from(args: &str) -> Option<MailFrom> {
    let addr_part = strip_prefix_ignore_case(args.trim(), "FROM:")?.trim_start();
    let (path, params) = split_path(addr_part)?;

    let size = params
        .split_whitespace()
        .find_map(|param| strip_prefix_ignore_case(param, "SIZE="))
        .and_then(|value| value.parse().ok());

    let sender = if path.is_empty() {
        None
    } else {
        Some(EmailAddress::parse(path)?)
    };

    Some(MailFrom { sender, size })
}

/// Parse RCPT TO:<address>
fn parse_rcpt_to(args: &str) -> Option<EmailAddress> {
    let addr_part = strip_prefix_ignore_case(args.trim(), "TO:")?.trim_start();
    let (path, _) = split_path(addr_part)?;
    EmailAddress::parse(path)
}

/// `<path> params` or a bare `path params`
fn split_path(input: &str) -> Option<(&str, &str)> {
    if let Some(rest) = input.strip_prefix('<') {
        let end = rest.find('>')?;
        Some((&rest[..end], &rest[end + 1..]))
    } else {
        let mut parts = input.splitn(2, ' ');
        let path = parts.next()?;
        Some((path, parts.next().unwrap_or("")))
    }
}

fn strip_prefix_ignore_case<'a>(input: &'a str, prefix: &str) -> Option<&'a str> {
    let head = input.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &input[prefix.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::tests::{add_token, service};
    use crate::smtp::policy::{RelayPolicy, SubmissionPolicy};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use mailgate_common::types::UserStatus;
    use mailgate_storage::{MemoryStore, MessageStore};
    use pretty_assertions::assert_eq;
    use tokio::io::DuplexStream;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        kermit: Inbox,
        piggy: Inbox,
        context: SmtpContext,
    }

    fn fixture(config: SmtpConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let user = store.add_user("kermit", None).unwrap();
        add_token(&store, user.id, "frog-token");
        let project = Uuid::new_v4();
        let kermit = store.add_inbox(project, "kermit@example.org").unwrap();
        let piggy = store.add_inbox(project, "piggy@example.org").unwrap();

        let context = SmtpContext {
            config,
            hostname: "mx.example.org".to_string(),
            ingestor: Arc::new(Ingestor::new(store.clone(), store.clone())),
            authenticator: Arc::new(SmtpAuthenticator::new(Arc::new(service(&store)))),
            tls_acceptor: None,
        };

        Fixture {
            store,
            kermit,
            piggy,
            context,
        }
    }

    struct Client {
        stream: BufReader<DuplexStream>,
    }

    impl Client {
        async fn connect(fixture: &Fixture, policy: Arc<dyn DeliveryPolicy>) -> (Self, String) {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let peer: SocketAddr = "192.0.2.7:52000".parse().unwrap();
            let handler = SmtpHandler::new(fixture.context.clone(), policy, peer);
            tokio::spawn(handler.handle(server));

            let mut client = Self {
                stream: BufReader::new(client),
            };
            let greeting = client.line().await;
            (client, greeting)
        }

        async fn line(&mut self) -> String {
            let mut line = String::new();
            self.stream.read_line(&mut line).await.unwrap();
            line
        }

        async fn send(&mut self, line: &str) {
            self.stream
                .write_all(format!("{}\r\n", line).as_bytes())
                .await
                .unwrap();
            self.stream.flush().await.unwrap();
        }

        /// Send a command and return its final reply line
        async fn command(&mut self, line: &str) -> String {
            self.send(line).await;
            loop {
                let reply = self.line().await;
                if reply.len() < 4 || reply.as_bytes()[3] != b'-' {
                    return reply.trim_end().to_string();
                }
            }
        }

        async fn ehlo(&mut self) -> Vec<String> {
            self.send("EHLO client.test").await;
            let mut lines = Vec::new();
            loop {
                let reply = self.line().await;
                let last = reply.as_bytes()[3] == b' ';
                lines.push(reply.trim_end().to_string());
                if last {
                    return lines;
                }
            }
        }
    }

    fn relay() -> Arc<dyn DeliveryPolicy> {
        Arc::new(RelayPolicy::new("example.org"))
    }

    async fn stored(store: &MemoryStore, inbox: &Inbox) -> Vec<mailgate_storage::StoredMessage> {
        let uids = store.get_all_uids_including_deleted(inbox.id).await.unwrap();
        store.get_by_uids(inbox.id, &uids).await.unwrap()
    }

    #[tokio::test]
    async fn test_relay_delivers_to_local_inboxes() {
        let fixture = fixture(SmtpConfig::default());
        let (mut client, greeting) = Client::connect(&fixture, relay()).await;
        assert_eq!(greeting, "220 mx.example.org ESMTP Mailgate\r\n");

        let ehlo = client.ehlo().await;
        assert_eq!(ehlo[0], "250-mx.example.org Hello client.test");
        assert!(!ehlo.iter().any(|l| l.contains("AUTH")));
        assert!(!ehlo.iter().any(|l| l.contains("STARTTLS")));

        assert_eq!(client.command("MAIL FROM:<fozzie@remote.test>").await, "250 2.1.0 OK");
        assert_eq!(
            client.command("RCPT TO:<someone@elsewhere.net>").await,
            "550 5.7.1 Relay not permitted"
        );
        assert_eq!(
            client.command("RCPT TO:<animal@example.org>").await,
            "550 5.1.1 User unknown"
        );
        assert_eq!(client.command("RCPT TO:<kermit.news@example.org>").await, "250 2.1.5 OK");
        assert_eq!(client.command("RCPT TO:<piggy@example.org>").await, "250 2.1.5 OK");

        assert_eq!(
            client.command("DATA").await,
            "354 End data with <CR><LF>.<CR><LF>"
        );
        client.send("Subject: Hello").await;
        client.send("").await;
        client.send("..leading dot").await;
        assert_eq!(client.command(".").await, "250 2.0.0 OK");

        let kermit = stored(&fixture.store, &fixture.kermit).await;
        assert_eq!(kermit.len(), 1);
        assert_eq!(kermit[0].subject, "Hello");
        assert_eq!(kermit[0].sender, "fozzie@remote.test");
        assert_eq!(kermit[0].receiver, "kermit.news@example.org");
        assert!(kermit[0].body.starts_with(".leading dot"));
        assert_eq!(stored(&fixture.store, &fixture.piggy).await.len(), 1);

        assert_eq!(client.command("QUIT").await, "221 2.0.0 Bye");
    }

    #[tokio::test]
    async fn test_relay_refuses_auth_and_bad_sequences() {
        let fixture = fixture(SmtpConfig::default());
        let (mut client, _) = Client::connect(&fixture, relay()).await;

        assert_eq!(
            client.command("MAIL FROM:<a@x.com>").await,
            "503 5.5.1 Bad sequence of commands"
        );
        client.ehlo().await;
        assert_eq!(client.command("AUTH PLAIN AAAA").await, "502 5.5.1 AUTH not supported");
        assert_eq!(client.command("DATA").await, "503 5.5.1 Bad sequence of commands");
        assert_eq!(client.command("MAIL FROM:<>").await, "250 2.1.0 OK");
        assert_eq!(client.command("RCPT TO:garbage").await, "501 5.1.3 Bad recipient address syntax");
        assert_eq!(client.command("RSET").await, "250 2.0.0 OK");
        assert_eq!(
            client.command("RCPT TO:<kermit@example.org>").await,
            "503 5.5.1 Bad sequence of commands"
        );
        assert_eq!(client.command("VRFY kermit").await, "252 2.5.2 Cannot VRFY user");
        assert_eq!(client.command("EXPN staff").await, "502 5.5.1 EXPN not supported");
        assert_eq!(client.command("STARTTLS").await, "502 5.5.1 STARTTLS not supported");
        assert_eq!(client.command("FROB").await, "500 5.5.2 Command not recognized");
    }

    #[tokio::test]
    async fn test_message_size_limit() {
        let config = SmtpConfig {
            max_message_size: 64,
            ..SmtpConfig::default()
        };
        let fixture = fixture(config);
        let (mut client, _) = Client::connect(&fixture, relay()).await;
        client.ehlo().await;

        assert_eq!(
            client.command("MAIL FROM:<a@x.com> SIZE=1000").await,
            "552 5.3.4 Message size exceeds fixed limit"
        );
        assert_eq!(client.command("MAIL FROM:<a@x.com>").await, "250 2.1.0 OK");
        assert_eq!(client.command("RCPT TO:<kermit@example.org>").await, "250 2.1.5 OK");
        client.command("DATA").await;
        client.send("Subject: big").await;
        client.send("").await;
        client.send(&"x".repeat(200)).await;
        assert_eq!(
            client.command(".").await,
            "552 5.3.4 Message size exceeds fixed limit"
        );
        assert!(stored(&fixture.store, &fixture.kermit).await.is_empty());
        assert_eq!(client.command("NOOP").await, "250 2.0.0 OK");
    }

    #[tokio::test]
    async fn test_too_many_recipients() {
        let config = SmtpConfig {
            max_recipients: 1,
            ..SmtpConfig::default()
        };
        let fixture = fixture(config);
        let (mut client, _) = Client::connect(&fixture, relay()).await;
        client.ehlo().await;
        client.command("MAIL FROM:<a@x.com>").await;
        assert_eq!(client.command("RCPT TO:<kermit@example.org>").await, "250 2.1.5 OK");
        assert_eq!(
            client.command("RCPT TO:<piggy@example.org>").await,
            "452 4.5.3 Too many recipients"
        );
    }

    #[tokio::test]
    async fn test_submission_requires_token_auth() {
        let fixture = fixture(SmtpConfig::default());
        let (mut client, _) = Client::connect(&fixture, Arc::new(SubmissionPolicy)).await;

        let ehlo = client.ehlo().await;
        assert_eq!(ehlo.last().unwrap(), "250 AUTH PLAIN LOGIN");

        assert_eq!(
            client.command("MAIL FROM:<kermit@example.org>").await,
            "530 5.7.0 Authentication required"
        );

        let wrong = BASE64.encode(b"\0kermit\0not-the-token");
        assert_eq!(
            client.command(&format!("AUTH PLAIN {}", wrong)).await,
            "535 5.7.8 Authentication credentials invalid"
        );

        let right = BASE64.encode(b"\0kermit\0frog-token");
        assert_eq!(
            client.command(&format!("AUTH PLAIN {}", right)).await,
            "235 2.7.0 Authentication successful"
        );
        assert_eq!(
            client.command(&format!("AUTH PLAIN {}", right)).await,
            "503 5.5.1 Already authenticated"
        );

        assert_eq!(client.command("MAIL FROM:<kermit@example.org>").await, "250 2.1.0 OK");
        assert_eq!(client.command("RCPT TO:<piggy@example.org>").await, "250 2.1.5 OK");
        client.command("DATA").await;
        client.send("Subject: Lunch").await;
        client.send("").await;
        client.send("Shall we?").await;
        assert_eq!(client.command(".").await, "250 2.0.0 OK");

        let piggy = stored(&fixture.store, &fixture.piggy).await;
        assert_eq!(piggy.len(), 1);
        assert_eq!(piggy[0].sender, "kermit@example.org");
    }

    #[tokio::test]
    async fn test_submission_auth_login_exchange() {
        let fixture = fixture(SmtpConfig::default());
        let (mut client, _) = Client::connect(&fixture, Arc::new(SubmissionPolicy)).await;
        client.ehlo().await;

        assert_eq!(client.command("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
        assert_eq!(client.command(&BASE64.encode("kermit")).await, "334 UGFzc3dvcmQ6");
        assert_eq!(
            client.command(&BASE64.encode("frog-token")).await,
            "235 2.7.0 Authentication successful"
        );
    }

    #[tokio::test]
    async fn test_submission_auth_edge_cases() {
        let fixture = fixture(SmtpConfig::default());
        let mut user = fixture.store.add_user("gonzo", None).unwrap();
        add_token(&fixture.store, user.id, "chicken");
        user.status = UserStatus::Inactive.to_string();
        fixture.store.insert_user(user).unwrap();

        let (mut client, _) = Client::connect(&fixture, Arc::new(SubmissionPolicy)).await;
        assert_eq!(
            client.command("AUTH PLAIN").await,
            "503 5.5.1 Bad sequence of commands"
        );
        client.ehlo().await;

        assert_eq!(client.command("AUTH PLAIN").await, "334");
        assert_eq!(client.command("*").await, "501 5.0.0 Authentication cancelled");
        assert_eq!(
            client.command("AUTH PLAIN !!!").await,
            "501 5.5.2 Cannot decode response"
        );
        assert_eq!(
            client.command("AUTH CRAM-MD5").await,
            "504 5.5.4 Unrecognized authentication mechanism"
        );
        let gonzo = BASE64.encode(b"\0gonzo\0chicken");
        assert_eq!(
            client.command(&format!("AUTH PLAIN {}", gonzo)).await,
            "550 5.7.1 Account disabled"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let config = SmtpConfig {
            read_timeout_secs: 5,
            ..SmtpConfig::default()
        };
        let fixture = fixture(config);
        let (mut client, _) = Client::connect(&fixture, relay()).await;
        assert_eq!(
            client.line().await,
            "421 4.4.2 mx.example.org Error: timeout exceeded\r\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_data_times_out() {
        let config = SmtpConfig {
            read_timeout_secs: 5,
            ..SmtpConfig::default()
        };
        let fixture = fixture(config);
        let (mut client, _) = Client::connect(&fixture, relay()).await;
        client.ehlo().await;
        client.command("MAIL FROM:<a@x.com>").await;
        client.command("RCPT TO:<kermit@example.org>").await;
        client.command("DATA").await;
        client.send("Subject: half a message").await;

        assert_eq!(
            client.line().await,
            "421 4.4.2 mx.example.org Error: timeout exceeded\r\n"
        );
        assert_eq!(client.line().await, "");
        assert!(stored(&fixture.store, &fixture.kermit).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_auth_challenge_times_out() {
        let config = SmtpConfig {
            read_timeout_secs: 5,
            ..SmtpConfig::default()
        };
        let fixture = fixture(config);
        let (mut client, _) = Client::connect(&fixture, Arc::new(SubmissionPolicy)).await;
        client.ehlo().await;

        assert_eq!(client.command("AUTH LOGIN").await, "334 VXNlcm5hbWU6");
        assert_eq!(
            client.line().await,
            "421 4.4.2 mx.example.org Error: timeout exceeded\r\n"
        );
        assert_eq!(client.line().await, "");
    }

    #[tokio::test]
    async fn test_read_data_unstuffs_dots() {
        let input = b"Subject: x\r\n..dot\r\n.\r\nQUIT\r\n";
        let mut reader = BufReader::new(&input[..]);
        let outcome = read_data(&mut reader, 1024, Duration::from_secs(5)).await.unwrap();
        let DataOutcome::Complete(data) = outcome else {
            panic!("expected complete message");
        };
        assert_eq!(data, b"Subject: x\r\n.dot\r\n".to_vec());

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "QUIT\r\n");
    }

    #[tokio::test]
    async fn test_read_data_bounds_unterminated_lines() {
        // A chunk boundary falls right before ".\r\n" inside the long line
        let mut input = "a".repeat(13).into_bytes();
        input.extend_from_slice(b".\r\nstill data\r\n.\r\n");
        let mut reader = BufReader::new(&input[..]);
        let outcome = read_data(&mut reader, 10, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, DataOutcome::TooLarge));

        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "");

        let huge = "x".repeat(100_000) + "\r\n.\r\n";
        let mut reader = BufReader::new(huge.as_bytes());
        let outcome = read_data(&mut reader, 64, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, DataOutcome::TooLarge));
    }

    #[test]
    fn test_parse_mail_from() {
        assert_eq!(
            parse_mail_from("FROM:<user@example.com>"),
            Some(MailFrom {
                sender: Some(EmailAddress::new("user", "example.com")),
                size: None,
            })
        );
        assert_eq!(
            parse_mail_from("from: <user@example.com> SIZE=1024 BODY=8BITMIME"),
            Some(MailFrom {
                sender: Some(EmailAddress::new("user", "example.com")),
                size: Some(1024),
            })
        );
        assert_eq!(
            parse_mail_from("FROM:<>"),
            Some(MailFrom {
                sender: None,
                size: None,
            })
        );
        assert_eq!(parse_mail_from("invalid"), None);
        assert_eq!(parse_mail_from("FROM:<nobody>"), None);
    }

    #[test]
    fn test_parse_rcpt_to() {
        assert_eq!(
            parse_rcpt_to("TO:<user@example.com>"),
            Some(EmailAddress::new("user", "example.com"))
        );
        assert_eq!(
            parse_rcpt_to("to: user@example.com"),
            Some(EmailAddress::new("user", "example.com"))
        );
        assert_eq!(parse_rcpt_to("TO:<>"), None);
    }
}
