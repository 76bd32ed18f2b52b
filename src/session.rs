// Copyright 2020 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The protocol state machine: one [`Session`] per connection, from either
//! end of the daemon dialogue.
//!
//! A session owns a read buffer and a write buffer and nothing else. The
//! caller appends inbound bytes with [`Session::feed`] and calls
//! [`Session::parse`] repeatedly; each call consumes at most one complete
//! message and may return an [`Event`]. Returning `None` means either "need
//! more bytes" or "handled internally" (for example an auth challenge the
//! session can answer itself), so drive it until no input is consumed.
//! Action methods append to the write buffer, which the caller drains with
//! [`Session::take_output`] onto its own transport.

use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use lazy_static::lazy_static;
#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use regex::Regex;

use crate::buffer::Buffer;
use crate::digest::{self, DigestKind, DigestProvider};
use crate::options::Options;

/// The newest protocol revision this engine speaks.
pub const LATEST_PROTOCOL: i32 = 31;
/// The oldest revision it will negotiate down to.
pub const OLDEST_PROTOCOL: i32 = 29;

/// Nested sub-dialogues never go deeper than this.
const MAX_STATE_DEPTH: usize = 8;

const MSG_DATA: u8 = 0;
const MSG_ERROR: u8 = 3;

/// Where a session is in the protocol dialogue.
///
/// Only a subset of the method surface is valid in each state; calling
/// anything else is an error. `Fatal` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    ClientReadProtocol,
    ClientLogin,
    DaemonReadVersion,
    DaemonServerReadModule,
    DaemonServerNegotiateModule,
    DaemonServerCheckAuth,
    DaemonServerReadCommand,
    DaemonServerSend,
    DaemonServerRun,
    Receiver,
    Fatal,
}

/// Something the peer said, surfaced from [`Session::parse`].
///
/// Events are ephemeral; the session doesn't keep them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The protocol version both ends settled on.
    Protocol(i32),
    /// A daemon client asked for this module.
    Module(String),
    /// A daemon client answered the auth challenge.
    Auth { username: String, passhash: String },
    /// The server wants credentials and the session has none to offer.
    AuthReqd(String),
    Ok,
    Exit,
    Info(String),
    /// A daemon client sent its argv, already applied to the options.
    Command(Vec<String>),
    Error(String),
}

/// A protocol session, either end of a daemon connection.
///
/// Construct with [`Session::new`], then pick a role with
/// [`Session::start_daemon_client`] or [`Session::start_daemon_server`].
pub struct Session {
    rbuf: Buffer,
    wbuf: Buffer,
    /// Demultiplexed bulk data, once the receiver is running.
    data: Buffer,
    opts: Options,
    protocol_version: i32,
    remote_version: Option<String>,
    state: State,
    stack: Vec<State>,
    module: Option<String>,
    username: Option<String>,
    password: Option<String>,
    passhash: Option<String>,
    daemon_challenge: Option<String>,
    daemon_module: Option<String>,
    digests: Option<Box<dyn DigestProvider>>,
    read_multiplex: bool,
}

fn parse_banner(line: &str) -> Option<(i32, i32)> {
    lazy_static! {
        static ref BANNER_RE: Regex = Regex::new(r"^@RSYNCD: ([0-9]+)\.([-0-9]+)$").unwrap();
    }
    let caps = BANNER_RE.captures(line)?;
    let major = caps[1].parse().ok()?;
    let minor = caps[2].parse().ok()?;
    Some((major, minor))
}

impl Session {
    /// A session in the `Initial` state, holding `opts` but no role yet.
    pub fn new(opts: Options) -> Session {
        Session {
            rbuf: Buffer::new(),
            wbuf: Buffer::new(),
            data: Buffer::new(),
            opts,
            protocol_version: LATEST_PROTOCOL,
            remote_version: None,
            state: State::Initial,
            stack: Vec::new(),
            module: None,
            username: None,
            password: None,
            passhash: None,
            daemon_challenge: None,
            daemon_module: None,
            digests: None,
            read_multiplex: false,
        }
    }

    /// Supply the checksum backend used for auth and file-list checksums.
    pub fn set_digest_provider(&mut self, provider: Box<dyn DigestProvider>) {
        self.digests = Some(provider);
    }

    /// Become the client end of a daemon connection.
    ///
    /// The server speaks first; nothing is written until its banner has
    /// been parsed. If a username and password are given (and a digest
    /// provider is set), the session answers any auth challenge itself;
    /// otherwise the challenge surfaces as an [`Event::AuthReqd`].
    pub fn start_daemon_client(
        &mut self,
        module: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<()> {
        self.expect_state(State::Initial, "start_daemon_client")?;
        self.module = Some(module.to_string());
        self.username = username.map(String::from);
        self.password = password.map(String::from);
        self.state = State::ClientReadProtocol;
        Ok(())
    }

    /// Become the server end of a daemon connection: the greeting goes to
    /// the write buffer immediately.
    pub fn start_daemon_server(&mut self) -> Result<()> {
        self.expect_state(State::Initial, "start_daemon_server")?;
        self.wbuf.pack_line(&format!("@RSYNCD: {}.0", LATEST_PROTOCOL));
        self.state = State::DaemonServerReadModule;
        self.push_state(State::DaemonReadVersion)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.opts
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.opts
    }

    /// The negotiated protocol version; [`LATEST_PROTOCOL`] until the
    /// peer's banner has been seen.
    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    /// The version string the peer advertised, like `"30.0"`. A negative
    /// minor part marks a pre-release.
    pub fn remote_version(&self) -> Option<&str> {
        self.remote_version.as_deref()
    }

    /// The module a daemon client asked this server for.
    pub fn daemon_module(&self) -> Option<&str> {
        self.daemon_module.as_deref()
    }

    pub fn daemon_challenge(&self) -> Option<&str> {
        self.daemon_challenge.as_deref()
    }

    /// The auth response this session last sent, if any.
    pub fn passhash(&self) -> Option<&str> {
        self.passhash.as_deref()
    }

    /// Append inbound bytes from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rbuf.append(bytes);
    }

    /// Bytes fed in but not yet consumed. When [`Session::parse`] returns
    /// `None` without shrinking this, it needs more input.
    pub fn pending_input(&self) -> usize {
        self.rbuf.remaining()
    }

    /// Outbound bytes waiting for the transport.
    pub fn output(&self) -> &[u8] {
        self.wbuf.as_bytes()
    }

    /// Remove and return all outbound bytes.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.wbuf.take()
    }

    /// The demultiplexed data stream, for the file-list and transfer
    /// decoders to read from.
    pub fn data(&mut self) -> &mut Buffer {
        &mut self.data
    }

    /// Try to consume one message from the read buffer.
    ///
    /// Consumes nothing if a complete message hasn't arrived yet. State
    /// transitions happen in here and in the action methods; a protocol
    /// violation surfaces as an [`Event::Error`] and moves the session to
    /// `Fatal`, after which all calls are errors.
    pub fn parse(&mut self) -> Result<Option<Event>> {
        match self.state {
            State::Fatal => bail!("session is in the fatal state"),
            State::Initial => bail!("session has no role yet"),
            State::ClientReadProtocol => self.parse_version_banner(true),
            State::DaemonReadVersion => self.parse_version_banner(false),
            State::ClientLogin => self.parse_client_login(),
            State::DaemonServerReadModule => self.parse_read_module(),
            State::DaemonServerNegotiateModule => Ok(None),
            State::DaemonServerCheckAuth => self.parse_check_auth(),
            State::DaemonServerReadCommand => self.parse_read_command(),
            State::DaemonServerSend | State::DaemonServerRun => Ok(None),
            State::Receiver => self.parse_receiver(),
        }
    }

    fn parse_version_banner(&mut self, client: bool) -> Result<Option<Event>> {
        let line = match self.rbuf.unpack_line() {
            Some(line) => line,
            None => return Ok(None),
        };
        self.rbuf.discard();
        let (major, minor) = match parse_banner(&line) {
            Some(v) => v,
            None => return self.fatal(format!("Strange greeting from peer: {:?}", line)),
        };
        self.remote_version = Some(format!("{}.{}", major, minor));
        // A non-zero minor part is a pre-release of the next version, so
        // the peer effectively speaks the one before it.
        let effective = if minor != 0 { major - 1 } else { major };
        let version = std::cmp::min(LATEST_PROTOCOL, effective);
        if version < OLDEST_PROTOCOL {
            return self.fatal(format!(
                "Peer protocol version {} is older than {}, which is as old as we go",
                version, OLDEST_PROTOCOL
            ));
        }
        self.protocol_version = version;
        debug!("negotiated protocol {} from {:?}", version, line);
        if client {
            self.wbuf.pack_line(&format!("@RSYNCD: {}.0", version));
            let module = self.module.clone().unwrap_or_default();
            self.wbuf.pack_line(&module);
            self.state = State::ClientLogin;
        } else {
            self.pop_state()?;
        }
        Ok(Some(Event::Protocol(version)))
    }

    fn parse_client_login(&mut self) -> Result<Option<Event>> {
        let line = match self.rbuf.unpack_line() {
            Some(line) => line,
            None => return Ok(None),
        };
        self.rbuf.discard();
        if let Some(salt) = line.strip_prefix("@RSYNCD: AUTHREQD ") {
            self.daemon_challenge = Some(salt.to_string());
            if let (Some(username), Some(password)) =
                (self.username.clone(), self.password.clone())
            {
                if self.digests.is_some() {
                    let hash = self.compute_passhash(&password)?;
                    self.wbuf.pack_line(&format!("{} {}", username, hash));
                    self.passhash = Some(hash);
                    return Ok(None);
                }
            }
            return Ok(Some(Event::AuthReqd(salt.to_string())));
        }
        if let Some(message) = line.strip_prefix("@ERROR: ") {
            return self.fatal(format!("Protocol error during login: {}", message));
        }
        match line.as_str() {
            "@RSYNCD: OK" => Ok(Some(Event::Ok)),
            "@RSYNCD: EXIT" => Ok(Some(Event::Exit)),
            _ => Ok(Some(Event::Info(line))),
        }
    }

    fn parse_read_module(&mut self) -> Result<Option<Event>> {
        let line = match self.rbuf.unpack_line() {
            Some(line) => line,
            None => return Ok(None),
        };
        self.rbuf.discard();
        self.daemon_module = Some(line.clone());
        self.state = State::DaemonServerNegotiateModule;
        Ok(Some(Event::Module(line)))
    }

    fn parse_check_auth(&mut self) -> Result<Option<Event>> {
        let line = match self.rbuf.unpack_line() {
            Some(line) => line,
            None => return Ok(None),
        };
        self.rbuf.discard();
        let mut words = line.splitn(2, ' ');
        match (words.next(), words.next()) {
            (Some(username), Some(passhash)) if !username.is_empty() && !passhash.is_empty() => {
                self.pop_state()?;
                Ok(Some(Event::Auth {
                    username: username.to_string(),
                    passhash: passhash.to_string(),
                }))
            }
            _ => self.fatal(format!("Invalid auth response: {:?}", line)),
        }
    }

    fn parse_read_command(&mut self) -> Result<Option<Event>> {
        // Argv elements arrive separated by a single terminator and ended
        // by a double one: NUL from protocol 30, newline before that.
        let term: u8 = if self.protocol_version >= 30 { 0 } else { b'\n' };
        let (args, consumed) = {
            let bytes = &self.rbuf.as_bytes()[self.rbuf.pos()..];
            let end = match bytes.windows(2).position(|w| w[0] == term && w[1] == term) {
                Some(end) => end,
                None => return Ok(None),
            };
            let args: Vec<String> = if end == 0 {
                Vec::new()
            } else {
                bytes[..end]
                    .split(|&b| b == term)
                    .map(|arg| String::from_utf8_lossy(arg).into_owned())
                    .collect()
            };
            (args, end + 2)
        };
        self.rbuf.set_pos(self.rbuf.pos() + consumed);
        self.rbuf.discard();
        match self.opts.apply_argv(&args) {
            Ok(()) => {
                self.state = if self.opts.sender != 0 {
                    State::DaemonServerSend
                } else {
                    State::DaemonServerRun
                };
                Ok(Some(Event::Command(args)))
            }
            Err(err) => self.fatal(format!("Client sent invalid command: {}", err)),
        }
    }

    fn parse_receiver(&mut self) -> Result<Option<Event>> {
        if !self.read_multiplex {
            if self.rbuf.remaining() == 0 {
                return Ok(None);
            }
            let n = self.rbuf.remaining();
            let bytes = self.rbuf.unpack_bytes(n).unwrap_or_default();
            self.rbuf.discard();
            self.data.append(&bytes);
            return Ok(None);
        }
        let (code, payload) = match self.rbuf.unpack_msg() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(None),
            Err(err) => return self.fatal(format!("Bad multiplex frame: {}", err)),
        };
        self.rbuf.discard();
        match code {
            MSG_DATA => {
                self.data.append(&payload);
                Ok(None)
            }
            MSG_ERROR => {
                let text = String::from_utf8_lossy(&payload).trim_end().to_string();
                self.fatal(format!("Remote error: {}", text))
            }
            _ => {
                let text = String::from_utf8_lossy(&payload).trim_end().to_string();
                Ok(Some(Event::Info(text)))
            }
        }
    }

    /// Send a message of the day: every line starting with `@` gets a
    /// leading space so it can't collide with protocol markers.
    pub fn send_motd(&mut self, motd: &str) -> Result<()> {
        self.expect_state(State::DaemonServerNegotiateModule, "send_motd")?;
        for line in motd.lines() {
            if line.starts_with('@') {
                self.wbuf.pack_line(&format!(" {}", line));
            } else {
                self.wbuf.pack_line(line);
            }
        }
        Ok(())
    }

    /// Send the module list, one per line, then the exit marker.
    pub fn send_module_list<S: AsRef<str>>(&mut self, modules: &[S]) -> Result<()> {
        self.expect_state(State::DaemonServerNegotiateModule, "send_module_list")?;
        for module in modules {
            self.wbuf.pack_line(module.as_ref());
        }
        self.wbuf.pack_line("@RSYNCD: EXIT");
        Ok(())
    }

    /// Challenge the client to authenticate, and wait for its response
    /// before returning to module negotiation.
    pub fn send_auth_challenge(&mut self, salt: &str) -> Result<()> {
        self.expect_state(State::DaemonServerNegotiateModule, "send_auth_challenge")?;
        if salt.contains('\n') {
            bail!("auth challenge must not contain a newline");
        }
        self.daemon_challenge = Some(salt.to_string());
        self.wbuf.pack_line(&format!("@RSYNCD: AUTHREQD {}", salt));
        self.push_state(State::DaemonServerCheckAuth)
    }

    pub fn send_ok(&mut self) -> Result<()> {
        self.expect_state(State::DaemonServerNegotiateModule, "send_ok")?;
        self.wbuf.pack_line("@RSYNCD: OK");
        self.state = State::DaemonServerReadCommand;
        Ok(())
    }

    /// Refuse the client and end the session.
    pub fn send_error(&mut self, message: &str) -> Result<()> {
        self.expect_state(State::DaemonServerNegotiateModule, "send_error")?;
        self.wbuf.pack_line(&format!("@ERROR: {}", message));
        self.state = State::Fatal;
        Ok(())
    }

    pub fn send_exit(&mut self) -> Result<()> {
        self.expect_state(State::DaemonServerNegotiateModule, "send_exit")?;
        self.wbuf.pack_line("@RSYNCD: EXIT");
        Ok(())
    }

    /// Answer an [`Event::AuthReqd`] with credentials the caller collected.
    pub fn send_auth_response(&mut self, username: &str, password: &str) -> Result<()> {
        self.expect_state(State::ClientLogin, "send_auth_response")?;
        let hash = self.compute_passhash(password)?;
        self.wbuf.pack_line(&format!("{} {}", username, hash));
        self.passhash = Some(hash);
        Ok(())
    }

    /// Hand the server its argv and switch to receiving.
    ///
    /// The command name in `cmd[0]` is dropped; the remaining arguments are
    /// written separated by a single terminator and ended by a double one
    /// (NUL from protocol 30, newline before that). From here on the
    /// server-to-client stream is multiplexed.
    pub fn start_remote_sender<S: AsRef<str>>(&mut self, cmd: &[S]) -> Result<()> {
        self.expect_state(State::ClientLogin, "start_remote_sender")?;
        if cmd.is_empty() {
            bail!("remote command is empty");
        }
        let term: &[u8] = if self.protocol_version >= 30 {
            b"\0"
        } else {
            b"\n"
        };
        for arg in &cmd[1..] {
            self.wbuf.pack_bytes(arg.as_ref().as_bytes());
            self.wbuf.pack_bytes(term);
        }
        self.wbuf.pack_bytes(term);
        self.read_multiplex = true;
        self.state = State::Receiver;
        Ok(())
    }

    /// Send one multiplex frame to the client.
    pub fn send_msg(&mut self, code: u8, payload: &[u8]) -> Result<()> {
        match self.state {
            State::DaemonServerSend | State::DaemonServerRun => {
                self.wbuf.pack_msg(code, payload)
            }
            State::Fatal => bail!("session is in the fatal state"),
            state => bail!("send_msg is not valid in state {:?}", state),
        }
    }

    /// The base64 auth digest for `password` against the session's
    /// challenge: MD5 from protocol 30, MD4 before, with the trailing `=`
    /// padding stripped.
    ///
    /// A server uses this to compute the response it expects.
    pub fn compute_passhash(&self, password: &str) -> Result<String> {
        let challenge = self
            .daemon_challenge
            .as_deref()
            .ok_or_else(|| anyhow!("no auth challenge has been seen"))?;
        let kind = if self.protocol_version >= 30 {
            DigestKind::Md5
        } else {
            DigestKind::Md4
        };
        let mut stream = digest::start_digest(self.digests.as_deref(), kind)?;
        stream.add(password.as_bytes());
        stream.add(challenge.as_bytes());
        Ok(STANDARD_NO_PAD.encode(stream.digest()))
    }

    fn fatal(&mut self, message: String) -> Result<Option<Event>> {
        warn!("fatal: {}", message);
        self.state = State::Fatal;
        Ok(Some(Event::Error(message)))
    }

    fn expect_state(&self, state: State, what: &str) -> Result<()> {
        if self.state == State::Fatal {
            bail!("session is in the fatal state");
        }
        if self.state != state {
            bail!("{} is not valid in state {:?}", what, self.state);
        }
        Ok(())
    }

    fn push_state(&mut self, state: State) -> Result<()> {
        if self.stack.len() >= MAX_STATE_DEPTH {
            bail!("state stack overflow");
        }
        self.stack.push(self.state);
        self.state = state;
        Ok(())
    }

    fn pop_state(&mut self) -> Result<()> {
        match self.stack.pop() {
            Some(state) => {
                self.state = state;
                Ok(())
            }
            None => bail!("state stack underflow"),
        }
    }
}
