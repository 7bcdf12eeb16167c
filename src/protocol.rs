//! Wire protocol: one whitespace-separated text line per datagram,
//! `TYPE [#rpcid] ARG...`.

use crate::error::{Error, Result};

pub const MSG_PING: &str = "PING";
pub const MSG_PONG: &str = "PONG";
pub const MSG_FIND_NODE: &str = "FIND_NODE";
pub const MSG_NODES: &str = "NODES";
pub const MSG_STORE: &str = "STORE";
pub const MSG_STORED: &str = "STORED";
pub const MSG_GET: &str = "GET";
pub const MSG_VALUE: &str = "VALUE";
pub const MSG_NOT_FOUND: &str = "NOT_FOUND";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: String,
    /// Correlation ID, 40 lowercase hex chars; empty until assigned.
    pub rpc_id: String,
    pub args: Vec<String>,
}

impl Message {
    pub fn new<T: Into<String>>(msg_type: T, args: Vec<String>) -> Self {
        Message {
            msg_type: msg_type.into(),
            rpc_id: String::new(),
            args,
        }
    }

    pub fn parse(line: &str) -> Result<Message> {
        let mut tokens = line.split_whitespace();
        let msg_type = tokens
            .next()
            .ok_or_else(|| Error::Parse("empty message".to_string()))?
            .to_string();
        if !msg_type.bytes().all(|b| b.is_ascii_uppercase() || b == b'_') {
            return Err(Error::Parse(format!("bad message type {:?}", msg_type)));
        }

        let mut rpc_id = String::new();
        let mut args = Vec::new();
        for (i, token) in tokens.enumerate() {
            if i == 0 && token.starts_with('#') {
                let id = &token[1..];
                if id.len() != 40 || !id.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
                    return Err(Error::Parse(format!("bad rpc id {:?}", id)));
                }
                rpc_id = id.to_string();
            } else {
                args.push(token.to_string());
            }
        }

        Ok(Message {
            msg_type,
            rpc_id,
            args,
        })
    }

    pub fn encode(&self) -> String {
        let mut out = self.msg_type.clone();
        if !self.rpc_id.is_empty() {
            out.push_str(" #");
            out.push_str(&self.rpc_id);
        }
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}
