use std::fmt;

/// 客户端发出的协商指令。
pub const PING: &[u8] = b"PING\n";
pub const STARTTLS: &[u8] = b"STARTTLS\n";
pub const QUIT: &[u8] = b"QUIT\n";
/// 服务端对 `PING` 的应答。
pub const PONG: &[u8] = b"PONG\n";
/// 服务端对无法识别指令的应答。
pub const UNKNOWN_REPLY: &[u8] = b"ERR unknown command\n";

/// 演示协议的一行指令。
///
/// 解析时忽略首尾 ASCII 空白（含 `\r\n`），并且不区分大小写，
/// 与常见行协议（SMTP/IMAP）对指令关键字的处理保持一致。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Ping,
    StartTls,
    Quit,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &[u8]) -> Self {
        let keyword = line.trim_ascii();
        if keyword.eq_ignore_ascii_case(b"PING") {
            Command::Ping
        } else if keyword.eq_ignore_ascii_case(b"STARTTLS") {
            Command::StartTls
        } else if keyword.eq_ignore_ascii_case(b"QUIT") {
            Command::Quit
        } else {
            Command::Unknown(String::from_utf8_lossy(keyword).into_owned())
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ping => f.write_str("PING"),
            Command::StartTls => f.write_str("STARTTLS"),
            Command::Quit => f.write_str("QUIT"),
            Command::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

/// 去掉行尾换行后的可读文本，用于日志与终端输出。
pub fn display_line(line: &[u8]) -> String {
    String::from_utf8_lossy(line.trim_ascii_end()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_case_insensitive_and_trimmed() {
        assert_eq!(Command::parse(b"PING\n"), Command::Ping);
        assert_eq!(Command::parse(b"  ping\r\n"), Command::Ping);
        assert_eq!(Command::parse(b"StartTls\n"), Command::StartTls);
        assert_eq!(Command::parse(b"quit"), Command::Quit);
    }

    #[test]
    fn unrecognised_lines_are_preserved() {
        assert_eq!(
            Command::parse(b"EHLO example.com\n"),
            Command::Unknown("EHLO example.com".to_string())
        );
        assert_eq!(Command::parse(b"\n"), Command::Unknown(String::new()));
    }

    #[test]
    fn wire_constants_parse_back_to_their_commands() {
        assert_eq!(Command::parse(PING), Command::Ping);
        assert_eq!(Command::parse(STARTTLS), Command::StartTls);
        assert_eq!(Command::parse(QUIT), Command::Quit);
        assert_eq!(display_line(PONG), "PONG");
    }
}
