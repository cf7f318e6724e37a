//! Minimal NMDC hub that logs clients in and relays their messages.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
};

pub struct NmdcHub {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl NmdcHub {
    pub async fn start() -> Self {
        Self::with_password(None).await
    }

    /// Every nick has to log in with `password`.
    pub async fn with_password(password: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared {
            password: password.map(str::to_owned),
            users: Mutex::new(BTreeMap::new()),
        });

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve(shared.clone(), stream));
            }
        });

        Self { addr, task }
    }

    pub fn url(&self) -> String {
        format!("nmdc://{}", self.addr)
    }
}

impl Drop for NmdcHub {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct User {
    tx: mpsc::UnboundedSender<String>,
    my_info: Option<String>,
}

struct Shared {
    password: Option<String>,
    users: Mutex<BTreeMap<String, User>>,
}

impl Shared {
    fn broadcast(&self, message: &str) {
        for user in self.users.lock().unwrap().values() {
            let _ = user.tx.send(format!("{}|", message));
        }
    }

    fn send_to(&self, nick: &str, message: &str) {
        if let Some(user) = self.users.lock().unwrap().get(nick) {
            let _ = user.tx.send(format!("{}|", message));
        }
    }
}

struct Connection {
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<String>,
    nick: Option<String>,
    awaiting_password: Option<String>,
}

impl Connection {
    fn send(&self, message: &str) {
        let _ = self.tx.send(format!("{}|", message));
    }

    fn log_in(&mut self, nick: String) {
        self.shared.users.lock().unwrap().insert(
            nick.clone(),
            User {
                tx: self.tx.clone(),
                my_info: None,
            },
        );
        self.send(&format!("$Hello {}", nick));
        self.nick = Some(nick);
    }

    /// Returns false to drop the client.
    fn handle(&mut self, line: &str) -> bool {
        let (command, args) = line.split_once(' ').unwrap_or((line, ""));

        match command {
            "$ValidateNick" => {
                if self.shared.users.lock().unwrap().contains_key(args) {
                    self.send(&format!("$ValidateDenide {}", args));
                    return false;
                }

                if self.shared.password.is_some() {
                    self.awaiting_password = Some(args.to_owned());
                    self.send("$GetPass");
                } else {
                    self.log_in(args.to_owned());
                }
            }
            "$MyPass" => {
                let nick = match self.awaiting_password.take() {
                    Some(nick) => nick,
                    None => return false,
                };

                if self.shared.password.as_deref() == Some(args) {
                    self.log_in(nick);
                } else {
                    self.send("$BadPass");
                    return false;
                }
            }
            _ if self.nick.is_none() => (),
            "$GetNickList" => {
                let own = self.nick.clone();
                let infos: Vec<String> = self
                    .shared
                    .users
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(nick, _)| Some(*nick) != own.as_ref())
                    .filter_map(|(_, user)| user.my_info.clone())
                    .collect();

                for info in infos {
                    self.send(&info);
                }
                self.send("$OpList $$");
            }
            "$MyINFO" => {
                if let Some(nick) = &self.nick {
                    if let Some(user) = self.shared.users.lock().unwrap().get_mut(nick) {
                        user.my_info = Some(line.to_owned());
                    }
                }
                self.shared.broadcast(line);
            }
            "$To:" => {
                if let Some((target, _)) = args.split_once(' ') {
                    self.shared.send_to(target, line);
                }
            }
            "$ConnectToMe" => {
                if let Some((target, _)) = args.split_once(' ') {
                    self.shared.send_to(target, line);
                }
            }
            "$RevConnectToMe" => {
                if let Some((_, target)) = args.split_once(' ') {
                    self.shared.send_to(target, line);
                }
            }
            "$Search" => self.shared.broadcast(line),
            "$SR" => {
                // Passive results end with the searcher's nick, which the hub strips.
                if let Some((reply, target)) = line.rsplit_once('\x05') {
                    self.shared.send_to(target, reply);
                }
            }
            _ if line.starts_with('<') => self.shared.broadcast(line),
            _ => (),
        }

        true
    }
}

async fn serve(shared: Arc<Shared>, stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if write_half.write_all(message.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut connection = Connection {
        shared: shared.clone(),
        tx,
        nick: None,
        awaiting_password: None,
    };

    connection.send("$Lock EXTENDEDPROTOCOL_TESTHUB Pk=testhub");
    connection.send("$HubName Test Hub");

    let mut reader = BufReader::new(read_half);
    loop {
        let mut buffer = Vec::new();
        match reader.read_until(b'|', &mut buffer).await {
            Ok(0) | Err(_) => break,
            Ok(_) => (),
        }

        if buffer.last() == Some(&b'|') {
            buffer.pop();
        }
        if buffer.is_empty() {
            continue;
        }

        let line = String::from_utf8_lossy(&buffer).into_owned();
        if !connection.handle(&line) {
            break;
        }
    }

    if let Some(nick) = connection.nick.take() {
        shared.users.lock().unwrap().remove(&nick);
        shared.broadcast(&format!("$Quit {}", nick));
    }
}
