//! Read-only `.netrc` lookup for upstream basic-auth credentials.
//!
//! A minimal reader, not a writer: the proxy only ever needs to look up
//! a `login`/`password` pair for a given upstream hostname.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Default)]
pub struct Netrc {
    machines: HashMap<String, Credentials>,
}

impl Netrc {
    pub fn parse(content: &str) -> Self {
        let mut machines = HashMap::new();

        let mut cur_machine: Option<String> = None;
        let mut cur_login: Option<String> = None;
        let mut cur_password: Option<String> = None;

        let mut remaining = content;
        loop {
            let (token, rest) = next_token(remaining);
            remaining = rest;
            if token.is_empty() && remaining.is_empty() {
                break;
            }

            match token {
                "machine" | "default" => {
                    flush(&mut machines, &mut cur_machine, &mut cur_login, &mut cur_password);
                    cur_machine = if token == "default" {
                        Some(String::new())
                    } else {
                        let (name, rest) = next_token(remaining);
                        remaining = rest;
                        Some(name.to_owned())
                    };
                }
                "login" => {
                    let (v, rest) = next_token(remaining);
                    remaining = rest;
                    cur_login = Some(v.to_owned());
                }
                "password" => {
                    let (v, rest) = next_token(remaining);
                    remaining = rest;
                    cur_password = Some(v.to_owned());
                }
                _ => {}
            }

            if remaining.is_empty() {
                break;
            }
        }
        flush(&mut machines, &mut cur_machine, &mut cur_login, &mut cur_password);

        Self { machines }
    }

    pub fn credentials_for(&self, host: &str) -> Option<&Credentials> {
        self.machines.get(host)
    }
}

fn flush(
    machines: &mut HashMap<String, Credentials>,
    cur_machine: &mut Option<String>,
    cur_login: &mut Option<String>,
    cur_password: &mut Option<String>,
) {
    if let (Some(name), Some(login), Some(password)) =
        (cur_machine.take(), cur_login.take(), cur_password.take())
    {
        if !name.is_empty() {
            machines.insert(name, Credentials { login, password });
        }
    }
}

fn next_token(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(|c: char| c.is_whitespace()) {
        Some(idx) => (&s[..idx], s[idx..].trim_start()),
        None => (s, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_credentials_for_matching_machine() {
        let netrc = Netrc::parse("machine cache.example login alice password hunter2");
        let creds = netrc.credentials_for("cache.example").unwrap();
        assert_eq!(creds.login, "alice");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn returns_none_for_unknown_host() {
        let netrc = Netrc::parse("machine cache.example login alice password hunter2");
        assert!(netrc.credentials_for("other.example").is_none());
    }

    #[test]
    fn handles_multiple_machines() {
        let netrc = Netrc::parse(
            "machine a.example login x password y\nmachine b.example login p password q",
        );
        assert_eq!(netrc.credentials_for("a.example").unwrap().login, "x");
        assert_eq!(netrc.credentials_for("b.example").unwrap().login, "p");
    }
}
