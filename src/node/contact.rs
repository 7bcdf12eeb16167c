use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddr;

use crate::error::{Error, Result};
use crate::key::Key;

/// A peer descriptor. The distance field caches the XOR distance to the
/// target of the lookup that produced the contact.
///
/// Two contacts are equal iff their IDs are equal.
#[derive(Clone, Eq)]
pub struct Contact {
    pub id: Key,
    pub address: SocketAddr,
    pub distance: Option<Key>,
}

impl PartialEq for Contact {
    fn eq(&self, other: &Contact) -> bool {
        self.id == other.id
    }
}

impl Debug for Contact {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

impl Contact {
    pub fn new(id: Key, address: SocketAddr) -> Self {
        Contact {
            id,
            address,
            distance: None,
        }
    }

    /// Fills the distance field relative to `target`.
    pub fn calc_distance(&mut self, target: &Key) {
        self.distance = Some(self.id.xor(target));
    }

    /// The wire form `hexid@host:port`. `SocketAddr` brackets IPv6 hosts.
    pub fn to_token(&self) -> String {
        format!("{}@{}", self.id.to_hex(), self.address)
    }

    pub fn from_token(token: &str) -> Result<Contact> {
        let mut parts = token.splitn(2, '@');
        let id_part = parts.next().unwrap_or("");
        let addr_part = parts
            .next()
            .ok_or_else(|| Error::Parse(format!("bad contact token {:?} (want <hexid>@<host:port>)", token)))?;
        let id = Key::from_hex(id_part)
            .map_err(|err| Error::Parse(format!("bad id in token {:?}: {}", token, err)))?;
        let address = addr_part
            .parse::<SocketAddr>()
            .map_err(|err| Error::Parse(format!("bad address in token {:?}: {}", token, err)))?;
        Ok(Contact::new(id, address))
    }

    pub fn from_token_with_distance(token: &str, target: &Key) -> Result<Contact> {
        let mut contact = Contact::from_token(token)?;
        contact.calc_distance(target);
        Ok(contact)
    }
}
