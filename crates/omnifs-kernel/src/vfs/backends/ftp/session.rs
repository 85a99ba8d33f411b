//! FTP control sessions.
//!
//! [`FtpSession`] is the command-level seam the filesystem talks to.
//! [`TcpFtpConnector`] speaks RFC 959 over TCP, wrapping the control and
//! data connections in TLS for `ftps` (implicit, port 990) and `ftpes`
//! (`AUTH TLS`, then `PBSZ 0` and `PROT P`). Test fakes plug in through
//! [`FtpConnector`].

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tracing::{debug, trace};

use super::error::FtpError;
use super::listing::{FtpEntry, format_timeval, parse_listing, parse_timeval};
use crate::config::FtpMode;

pub type DataReader = Box<dyn AsyncRead + Send + Unpin>;
pub type DataWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport security requested by the URI scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpSecurity {
    /// `ftp`
    Plain,
    /// `ftps`: TLS from the first byte.
    Implicit,
    /// `ftpes`: AUTH TLS on a plain connection.
    Explicit,
}

/// Control-channel text encoding, any WHATWG label.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Encoding(&'static encoding_rs::Encoding);

impl Encoding {
    pub fn utf8() -> Self {
        Encoding(encoding_rs::UTF_8)
    }

    /// What `latin1` and `iso-8859-1` resolve to.
    pub fn latin1() -> Self {
        Encoding(encoding_rs::WINDOWS_1252)
    }

    pub fn from_label(label: &str) -> Option<Self> {
        encoding_rs::Encoding::for_label(label.trim().as_bytes()).map(Encoding)
    }

    pub fn name(self) -> &'static str {
        self.0.name()
    }

    pub fn is_utf8(self) -> bool {
        self.0 == encoding_rs::UTF_8
    }

    /// Path bytes to wire bytes, or `None` when a character has no
    /// representation in this encoding.
    pub fn encode(self, bytes: &[u8]) -> Option<Vec<u8>> {
        if self.is_utf8() {
            return Some(bytes.to_vec());
        }
        let text = std::str::from_utf8(bytes).ok()?;
        let (wire, _, unmappable) = self.0.encode(text);
        (!unmappable).then(|| wire.into_owned())
    }

    pub fn decode(self, bytes: &[u8]) -> Vec<u8> {
        if self.is_utf8() {
            return bytes.to_vec();
        }
        let (text, _) = self.0.decode_without_bom_handling(bytes);
        text.into_owned().into_bytes()
    }
}

impl fmt::Debug for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where and how to connect.
#[derive(Clone)]
pub struct FtpTarget {
    pub security: FtpSecurity,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub mode: FtpMode,
    pub encoding: Encoding,
    pub connect_timeout: Duration,
}

impl fmt::Debug for FtpTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpTarget")
            .field("security", &self.security)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("mode", &self.mode)
            .field("encoding", &self.encoding)
            .finish_non_exhaustive()
    }
}

/// One logged-in control connection. Paths are absolute wire bytes.
///
/// `retrieve` and `store` start a transfer; the session is busy until
/// `finish_transfer` reads the completion reply.
#[async_trait]
pub trait FtpSession: Send {
    async fn list(&mut self, dir: &[u8]) -> Result<Vec<FtpEntry>, FtpError>;

    async fn retrieve(&mut self, path: &[u8]) -> Result<DataReader, FtpError>;

    async fn store(&mut self, path: &[u8], append: bool) -> Result<DataWriter, FtpError>;

    async fn finish_transfer(&mut self) -> Result<(), FtpError>;

    async fn size(&mut self, path: &[u8]) -> Result<u64, FtpError>;

    async fn modified(&mut self, path: &[u8]) -> Result<SystemTime, FtpError>;

    async fn set_modified(&mut self, path: &[u8], time: SystemTime) -> Result<(), FtpError>;

    async fn make_directory(&mut self, path: &[u8]) -> Result<(), FtpError>;

    async fn remove_directory(&mut self, path: &[u8]) -> Result<(), FtpError>;

    async fn delete_file(&mut self, path: &[u8]) -> Result<(), FtpError>;

    async fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<(), FtpError>;

    /// Keep-alive.
    async fn noop(&mut self) -> Result<(), FtpError>;

    async fn quit(&mut self) -> Result<(), FtpError>;
}

#[async_trait]
pub trait FtpConnector: Send + Sync + fmt::Debug {
    async fn connect(&self, target: &FtpTarget) -> Result<Box<dyn FtpSession>, FtpError>;
}

/// Client TLS settings trusting the bundled web PKI roots.
pub fn default_tls_config() -> Result<Arc<ClientConfig>, FtpError> {
    let roots = RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| FtpError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// TCP connector for all three schemes.
#[derive(Debug, Clone, Default)]
pub struct TcpFtpConnector {
    tls: Option<Arc<ClientConfig>>,
}

impl TcpFtpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config` instead of [`default_tls_config`] for `ftps` and `ftpes`.
    pub fn with_tls_config(config: Arc<ClientConfig>) -> Self {
        Self { tls: Some(config) }
    }

    fn secure_channel(&self, target: &FtpTarget) -> Result<Option<TlsSetup>, FtpError> {
        if target.security == FtpSecurity::Plain {
            return Ok(None);
        }
        let config = match &self.tls {
            Some(config) => config.clone(),
            None => default_tls_config()?,
        };
        let server_name = ServerName::try_from(target.host.clone())
            .map_err(|_| FtpError::Tls(format!("{:?} is not a valid TLS server name", target.host)))?;
        Ok(Some(TlsSetup {
            connector: TlsConnector::from(config),
            server_name,
            timeout: target.connect_timeout,
        }))
    }
}

#[async_trait]
impl FtpConnector for TcpFtpConnector {
    async fn connect(&self, target: &FtpTarget) -> Result<Box<dyn FtpSession>, FtpError> {
        let tls = self.secure_channel(target)?;
        let stream = tokio::time::timeout(
            target.connect_timeout,
            TcpStream::connect((target.host.as_str(), target.port)),
        )
        .await
        .map_err(|_| {
            FtpError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("connecting to {}:{}", target.host, target.port),
            ))
        })??;
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let control: Channel = match (&tls, target.security) {
            (Some(tls), FtpSecurity::Implicit) => Box::new(tls.wrap(stream).await?),
            _ => Box::new(stream),
        };
        let mut session = TcpFtpSession {
            control: BufReader::new(control),
            peer,
            local,
            tls,
            mode: target.mode,
            timeout: target.connect_timeout,
            mlsd: false,
            active: None,
        };
        session.login(target).await?;
        debug!(
            host = %target.host,
            port = target.port,
            security = ?target.security,
            mlsd = session.mlsd,
            "ftp session ready"
        );
        Ok(Box::new(session))
    }
}

/// A control or data connection, plain or TLS.
trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

type Channel = Box<dyn Stream>;

/// TLS parameters shared by the control and data connections of a session.
struct TlsSetup {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    timeout: Duration,
}

impl TlsSetup {
    async fn wrap<S>(&self, stream: S) -> Result<tokio_rustls::client::TlsStream<S>, FtpError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let handshake = self.connector.connect(self.server_name.clone(), stream);
        tokio::time::timeout(self.timeout, handshake)
            .await
            .map_err(|_| FtpError::Tls("handshake timed out".into()))?
            .map_err(|e| FtpError::Tls(e.to_string()))
    }
}

/// A parsed server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn expect(self, ok: &[u16]) -> Result<Reply, FtpError> {
        if ok.contains(&self.code) {
            Ok(self)
        } else {
            Err(FtpError::reply(self.code, self.text()))
        }
    }
}

fn reply_code(line: &str) -> Option<u16> {
    if line.len() < 3 || !line.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
        return None;
    }
    line[..3].parse().ok()
}

/// Port from `229 Entering Extended Passive Mode (|||6446|)`.
pub fn parse_epsv(text: &str) -> Option<u16> {
    let start = text.find('(')?;
    let end = text[start..].find(')')? + start;
    let inner = &text[start + 1..end];
    let delim = inner.chars().next()?;
    inner
        .split(delim)
        .filter(|s| !s.is_empty())
        .next_back()?
        .parse()
        .ok()
}

/// Address from `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)`.
pub fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let start = text.find('(').map_or(0, |i| i + 1);
    let digits: Vec<u8> = text[start..]
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .take(6)
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if digits.len() != 6 {
        return None;
    }
    let ip = IpAddr::from([digits[0], digits[1], digits[2], digits[3]]);
    let port = u16::from(digits[4]) << 8 | u16::from(digits[5]);
    Some(SocketAddr::new(ip, port))
}

pub struct TcpFtpSession {
    control: BufReader<Channel>,
    peer: SocketAddr,
    local: SocketAddr,
    /// Set for `ftps` and `ftpes`; data connections are wrapped too.
    tls: Option<TlsSetup>,
    mode: FtpMode,
    timeout: Duration,
    mlsd: bool,
    /// Listener for an active-mode transfer that has been announced.
    active: Option<TcpListener>,
}

impl TcpFtpSession {
    async fn read_reply(&mut self) -> Result<Reply, FtpError> {
        let mut lines = Vec::new();
        let mut code = None;
        loop {
            let mut raw = Vec::new();
            let n = self.control.read_until(b'\n', &mut raw).await?;
            if n == 0 {
                return Err(FtpError::Protocol("control connection closed".into()));
            }
            let line = String::from_utf8_lossy(&raw)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            trace!(%line, "ftp <");
            let this_code = reply_code(&line);
            let first = code.is_none();
            if first {
                code = Some(
                    this_code.ok_or_else(|| FtpError::Protocol(format!("bad reply: {line}")))?,
                );
            }
            let done = this_code == code && line.as_bytes().get(3) != Some(&b'-');
            let text = match this_code {
                Some(_) => line.get(4..).unwrap_or_default(),
                None => line.as_str(),
            };
            lines.push(text.to_string());
            if done {
                break;
            }
        }
        Ok(Reply {
            code: code.unwrap_or_default(),
            lines,
        })
    }

    async fn send(&mut self, verb: &str, arg: Option<&[u8]>) -> Result<(), FtpError> {
        let mut line = verb.as_bytes().to_vec();
        if let Some(arg) = arg {
            if arg.iter().any(|&b| b == b'\r' || b == b'\n') {
                return Err(FtpError::reply(553, "line break in argument"));
            }
            line.push(b' ');
            line.extend_from_slice(arg);
        }
        if verb == "PASS" {
            trace!("ftp > PASS ****");
        } else {
            trace!(line = %String::from_utf8_lossy(&line), "ftp >");
        }
        line.extend_from_slice(b"\r\n");
        let stream = self.control.get_mut();
        stream.write_all(&line).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn command(&mut self, verb: &str, arg: Option<&[u8]>) -> Result<Reply, FtpError> {
        self.send(verb, arg).await?;
        self.read_reply().await
    }

    /// Swap the plain control connection for a TLS one after `AUTH TLS`.
    async fn upgrade_control(&mut self) -> Result<(), FtpError> {
        let Some(tls) = &self.tls else {
            return Err(FtpError::Tls("no TLS settings for this session".into()));
        };
        let detached: Channel = Box::new(tokio::io::duplex(1).0);
        let plain = std::mem::replace(&mut self.control, BufReader::new(detached));
        if !plain.buffer().is_empty() {
            return Err(FtpError::Protocol("data after AUTH TLS reply".into()));
        }
        let secured: Channel = Box::new(tls.wrap(plain.into_inner()).await?);
        self.control = BufReader::new(secured);
        Ok(())
    }

    async fn login(&mut self, target: &FtpTarget) -> Result<(), FtpError> {
        self.read_reply().await?.expect(&[220])?;
        if target.security == FtpSecurity::Explicit {
            self.command("AUTH", Some(b"TLS")).await?.expect(&[234])?;
            self.upgrade_control().await?;
        }
        let reply = self.command("USER", Some(target.user.as_bytes())).await?;
        match reply.code {
            230 => {}
            331 => {
                let password = target.password.as_deref().unwrap_or("");
                self.command("PASS", Some(password.as_bytes()))
                    .await?
                    .expect(&[230, 202])?;
            }
            code => return Err(FtpError::reply(code, reply.text())),
        }
        if self.tls.is_some() {
            self.command("PBSZ", Some(b"0")).await?.expect(&[200])?;
            self.command("PROT", Some(b"P")).await?.expect(&[200])?;
        }
        self.command("TYPE", Some(b"I")).await?.expect(&[200])?;
        let features = self.command("FEAT", None).await?;
        if features.code == 211 {
            self.mlsd = features
                .lines
                .iter()
                .any(|l| l.trim().eq_ignore_ascii_case("MLSD") || l.trim().starts_with("MLST"));
            let utf8 = features.lines.iter().any(|l| l.trim().eq_ignore_ascii_case("UTF8"));
            if utf8 && target.encoding.is_utf8() {
                let _ = self.command("OPTS", Some(b"UTF8 ON")).await?;
            }
        }
        Ok(())
    }

    /// Prepare a data connection. Passive mode connects now; active mode
    /// listens and accepts after the transfer command.
    async fn open_data(&mut self) -> Result<Option<TcpStream>, FtpError> {
        let peer = self.peer;
        match self.mode {
            FtpMode::Passive => {
                let reply = self.command("EPSV", None).await?;
                let addr = if reply.code == 229 {
                    let port = parse_epsv(&reply.text())
                        .ok_or_else(|| FtpError::Protocol(format!("bad EPSV reply: {}", reply.text())))?;
                    SocketAddr::new(peer.ip(), port)
                } else {
                    let reply = self.command("PASV", None).await?.expect(&[227])?;
                    let announced = parse_pasv(&reply.text())
                        .ok_or_else(|| FtpError::Protocol(format!("bad PASV reply: {}", reply.text())))?;
                    // Servers behind NAT announce private addresses.
                    SocketAddr::new(peer.ip(), announced.port())
                };
                let stream = tokio::time::timeout(self.timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| FtpError::Protocol(format!("data connection to {addr} timed out")))??;
                Ok(Some(stream))
            }
            FtpMode::Active => {
                let local = self.local;
                let listener = TcpListener::bind(SocketAddr::new(local.ip(), 0)).await?;
                let port = listener.local_addr()?.port();
                let command = match local.ip() {
                    IpAddr::V4(ip) => {
                        let [a, b, c, d] = ip.octets();
                        ("PORT", format!("{a},{b},{c},{d},{},{}", port >> 8, port & 0xff))
                    }
                    IpAddr::V6(ip) => ("EPRT", format!("|2|{ip}|{port}|")),
                };
                self.command(command.0, Some(command.1.as_bytes()))
                    .await?
                    .expect(&[200])?;
                self.active = Some(listener);
                Ok(None)
            }
        }
    }

    /// Send the transfer command and return the connected data stream.
    /// Under `PROT P` the TLS handshake starts once the server has
    /// accepted the command.
    async fn start_transfer(&mut self, verb: &str, path: &[u8]) -> Result<Channel, FtpError> {
        let passive = self.open_data().await?;
        let reply = self.command(verb, Some(path)).await?;
        let listener = self.active.take();
        reply.expect(&[125, 150])?;
        let stream = match (passive, listener) {
            (Some(stream), _) => stream,
            (None, Some(listener)) => {
                let (stream, _) = tokio::time::timeout(self.timeout, listener.accept())
                    .await
                    .map_err(|_| FtpError::Protocol("server never opened the data connection".into()))??;
                stream
            }
            (None, None) => return Err(FtpError::Protocol("no data connection".into())),
        };
        match &self.tls {
            Some(tls) => Ok(Box::new(tls.wrap(stream).await?)),
            None => Ok(Box::new(stream)),
        }
    }
}

#[async_trait]
impl FtpSession for TcpFtpSession {
    async fn list(&mut self, dir: &[u8]) -> Result<Vec<FtpEntry>, FtpError> {
        let verb = if self.mlsd { "MLSD" } else { "LIST" };
        let mut data = self.start_transfer(verb, dir).await?;
        let mut raw = Vec::new();
        data.read_to_end(&mut raw).await?;
        drop(data);
        self.finish_transfer().await?;
        Ok(parse_listing(&raw, self.mlsd, SystemTime::now()))
    }

    async fn retrieve(&mut self, path: &[u8]) -> Result<DataReader, FtpError> {
        Ok(Box::new(self.start_transfer("RETR", path).await?))
    }

    async fn store(&mut self, path: &[u8], append: bool) -> Result<DataWriter, FtpError> {
        let verb = if append { "APPE" } else { "STOR" };
        Ok(Box::new(self.start_transfer(verb, path).await?))
    }

    async fn finish_transfer(&mut self) -> Result<(), FtpError> {
        self.read_reply().await?.expect(&[226, 250])?;
        Ok(())
    }

    async fn size(&mut self, path: &[u8]) -> Result<u64, FtpError> {
        let reply = self.command("SIZE", Some(path)).await?.expect(&[213])?;
        reply
            .text()
            .trim()
            .parse()
            .map_err(|_| FtpError::Protocol(format!("bad SIZE reply: {}", reply.text())))
    }

    async fn modified(&mut self, path: &[u8]) -> Result<SystemTime, FtpError> {
        let reply = self.command("MDTM", Some(path)).await?.expect(&[213])?;
        parse_timeval(reply.text().trim())
            .ok_or_else(|| FtpError::Protocol(format!("bad MDTM reply: {}", reply.text())))
    }

    async fn set_modified(&mut self, path: &[u8], time: SystemTime) -> Result<(), FtpError> {
        let mut arg = format_timeval(time).into_bytes();
        arg.push(b' ');
        arg.extend_from_slice(path);
        self.command("MFMT", Some(&arg)).await?.expect(&[213, 253])?;
        Ok(())
    }

    async fn make_directory(&mut self, path: &[u8]) -> Result<(), FtpError> {
        self.command("MKD", Some(path)).await?.expect(&[257, 250])?;
        Ok(())
    }

    async fn remove_directory(&mut self, path: &[u8]) -> Result<(), FtpError> {
        self.command("RMD", Some(path)).await?.expect(&[250])?;
        Ok(())
    }

    async fn delete_file(&mut self, path: &[u8]) -> Result<(), FtpError> {
        self.command("DELE", Some(path)).await?.expect(&[250])?;
        Ok(())
    }

    async fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<(), FtpError> {
        self.command("RNFR", Some(from)).await?.expect(&[350])?;
        self.command("RNTO", Some(to)).await?.expect(&[250])?;
        Ok(())
    }

    async fn noop(&mut self) -> Result<(), FtpError> {
        self.command("NOOP", None).await?.expect(&[200])?;
        Ok(())
    }

    async fn quit(&mut self) -> Result<(), FtpError> {
        self.command("QUIT", None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_rustls::TlsAcceptor;
    use tokio_rustls::rustls::ServerConfig;
    use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

    #[test]
    fn test_encoding() {
        let latin1 = Encoding::from_label("iso-8859-1").unwrap();
        assert_eq!(latin1, Encoding::latin1());
        assert_eq!(latin1.encode("caf\u{e9}".as_bytes()), Some(b"caf\xe9".to_vec()));
        assert_eq!(latin1.encode("\u{263a}".as_bytes()), None);
        assert_eq!(latin1.decode(b"caf\xe9"), "caf\u{e9}".as_bytes());
        assert_eq!(Encoding::from_label("utf8"), Some(Encoding::utf8()));
        assert_eq!(Encoding::from_label(" UTF-8 "), Some(Encoding::utf8()));
        assert_eq!(Encoding::from_label("klingon"), None);
    }

    #[test]
    fn test_other_charsets() {
        let cyrillic = Encoding::from_label("koi8-r").unwrap();
        assert_eq!(cyrillic.name(), "KOI8-R");
        let name = "\u{43f}\u{440}\u{438}\u{432}\u{435}\u{442}.txt";
        let wire = cyrillic.encode(name.as_bytes()).unwrap();
        assert_eq!(wire, b"\xd0\xd2\xc9\xd7\xc5\xd4.txt");
        assert_eq!(cyrillic.decode(&wire), name.as_bytes());

        let japanese = Encoding::from_label("shift_jis").unwrap();
        let wire = japanese.encode("\u{65e5}\u{672c}".as_bytes()).unwrap();
        assert_eq!(wire, b"\x93\xfa\x96\x7b");
        assert_eq!(japanese.decode(&wire), "\u{65e5}\u{672c}".as_bytes());
    }

    #[test]
    fn test_passive_replies() {
        assert_eq!(parse_epsv("Entering Extended Passive Mode (|||6446|)"), Some(6446));
        assert_eq!(
            parse_pasv("Entering Passive Mode (192,168,1,2,19,137)"),
            Some("192.168.1.2:5001".parse().unwrap())
        );
        assert_eq!(parse_pasv("Entering Passive Mode"), None);
    }

    /// Scripted server: answers each expected command with a canned reply.
    async fn scripted_server(script: Vec<(&'static str, &'static str)>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            stream
                .get_mut()
                .write_all(b"220-welcome\r\n220 ready\r\n")
                .await
                .unwrap();
            for (expected, reply) in script {
                let mut line = String::new();
                stream.read_line(&mut line).await.unwrap();
                assert!(line.starts_with(expected), "got {line:?}, expected {expected}");
                stream.get_mut().write_all(reply.as_bytes()).await.unwrap();
            }
        });
        addr
    }

    fn target(addr: SocketAddr) -> FtpTarget {
        FtpTarget {
            security: FtpSecurity::Plain,
            host: addr.ip().to_string(),
            port: addr.port(),
            user: "alice".into(),
            password: Some("secret".into()),
            mode: FtpMode::Passive,
            encoding: Encoding::utf8(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_login_and_commands() {
        let addr = scripted_server(vec![
            ("USER alice", "331 password please\r\n"),
            ("PASS secret", "230 logged in\r\n"),
            ("TYPE I", "200 ok\r\n"),
            ("FEAT", "211-Features:\r\n MLSD\r\n SIZE\r\n211 End\r\n"),
            ("SIZE /a", "213 1234\r\n"),
            ("RNFR /a", "350 ready\r\n"),
            ("RNTO /b", "250 done\r\n"),
            ("DELE /missing", "550 no such file\r\n"),
        ])
        .await;
        let mut session = TcpFtpConnector::new().connect(&target(addr)).await.unwrap();
        assert_eq!(session.size(b"/a").await.unwrap(), 1234);
        session.rename(b"/a", b"/b").await.unwrap();
        let err = session.delete_file(b"/missing").await.unwrap_err();
        assert_eq!(err.code(), Some(550));
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let addr = scripted_server(vec![("USER alice", "530 not allowed\r\n")]).await;
        let err = TcpFtpConnector::new().connect(&target(addr)).await.err().unwrap();
        assert_eq!(err.code(), Some(530));
    }

    const LISTING: &[u8] = b"-rw-r--r--   1 ftp ftp        5 Jan  1  2024 a.txt\r\n";

    fn test_certificate() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let cert = CertificateDer::from(include_bytes!("testdata/localhost.cert.der").to_vec());
        let key = PrivatePkcs8KeyDer::from(include_bytes!("testdata/localhost.key.der").to_vec());
        (cert, PrivateKeyDer::Pkcs8(key))
    }

    /// Connector trusting only the bundled localhost certificate.
    fn trusting_connector() -> TcpFtpConnector {
        let mut roots = RootCertStore::empty();
        roots.add(test_certificate().0).unwrap();
        let config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TcpFtpConnector::with_tls_config(Arc::new(config))
    }

    fn acceptor() -> TlsAcceptor {
        let (cert, key) = test_certificate();
        let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        TlsAcceptor::from(Arc::new(config))
    }

    async fn send_reply(control: &mut BufReader<Channel>, text: &str) {
        control.get_mut().write_all(text.as_bytes()).await.unwrap();
        control.get_mut().flush().await.unwrap();
    }

    /// Scripted TLS server. `EPSV` opens a data listener; a `150` reply
    /// is followed by [`LISTING`] over a TLS data connection and `226`.
    async fn tls_server(implicit: bool, script: Vec<(&'static str, &'static str)>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = acceptor();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let tcp = if implicit {
                tcp
            } else {
                let mut plain = BufReader::new(tcp);
                plain.get_mut().write_all(b"220 ready\r\n").await.unwrap();
                let mut line = String::new();
                plain.read_line(&mut line).await.unwrap();
                assert_eq!(line, "AUTH TLS\r\n");
                plain.get_mut().write_all(b"234 proceed\r\n").await.unwrap();
                plain.into_inner()
            };
            let Ok(secured) = acceptor.accept(tcp).await else {
                return;
            };
            let secured: Channel = Box::new(secured);
            let mut control = BufReader::new(secured);
            if implicit {
                send_reply(&mut control, "220 ready\r\n").await;
            }
            let mut data = None;
            for (expected, reply) in script {
                let mut line = String::new();
                control.read_line(&mut line).await.unwrap();
                assert!(line.starts_with(expected), "got {line:?}, expected {expected}");
                if expected == "EPSV" {
                    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                    let port = listener.local_addr().unwrap().port();
                    data = Some(listener);
                    let reply = format!("229 Entering Extended Passive Mode (|||{port}|)\r\n");
                    send_reply(&mut control, &reply).await;
                    continue;
                }
                send_reply(&mut control, reply).await;
                if reply.starts_with("150") {
                    let (tcp, _) = data.take().unwrap().accept().await.unwrap();
                    let mut stream = acceptor.accept(tcp).await.unwrap();
                    stream.write_all(LISTING).await.unwrap();
                    stream.shutdown().await.unwrap();
                    send_reply(&mut control, "226 done\r\n").await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_explicit_tls_session() {
        let addr = tls_server(
            false,
            vec![
                ("USER alice", "331 password please\r\n"),
                ("PASS secret", "230 logged in\r\n"),
                ("PBSZ 0", "200 PBSZ=0\r\n"),
                ("PROT P", "200 protection private\r\n"),
                ("TYPE I", "200 ok\r\n"),
                ("FEAT", "211-Features:\r\n SIZE\r\n211 End\r\n"),
                ("EPSV", ""),
                ("LIST /pub", "150 here it comes\r\n"),
                ("SIZE /pub/a.txt", "213 5\r\n"),
            ],
        )
        .await;
        let mut target = target(addr);
        target.security = FtpSecurity::Explicit;
        let mut session = trusting_connector().connect(&target).await.unwrap();

        let entries = session.list(b"/pub").await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_slice()).collect();
        assert_eq!(names, vec![&b"a.txt"[..]]);
        assert_eq!(entries[0].size, 5);
        assert_eq!(session.size(b"/pub/a.txt").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_implicit_tls_session() {
        let addr = tls_server(
            true,
            vec![
                ("USER alice", "230 welcome back\r\n"),
                ("PBSZ 0", "200 PBSZ=0\r\n"),
                ("PROT P", "200 protection private\r\n"),
                ("TYPE I", "200 ok\r\n"),
                ("FEAT", "502 no features\r\n"),
                ("NOOP", "200 ok\r\n"),
            ],
        )
        .await;
        let mut target = target(addr);
        target.security = FtpSecurity::Implicit;
        let mut session = trusting_connector().connect(&target).await.unwrap();
        session.noop().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_auth_tls_does_not_fall_back() {
        let addr = scripted_server(vec![("AUTH TLS", "502 not implemented\r\n")]).await;
        let mut target = target(addr);
        target.security = FtpSecurity::Explicit;
        let err = trusting_connector().connect(&target).await.err().unwrap();
        assert_eq!(err.code(), Some(502));
    }

    #[tokio::test]
    async fn test_untrusted_certificate() {
        let addr = tls_server(true, Vec::new()).await;
        let mut target = target(addr);
        target.security = FtpSecurity::Implicit;
        let err = TcpFtpConnector::new().connect(&target).await.err().unwrap();
        assert!(matches!(err, FtpError::Tls(_)), "{err}");
        assert!(err.is_fatal());
    }
}
