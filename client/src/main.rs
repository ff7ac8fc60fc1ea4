use std::env;
use std::io::{stdin, BufRead, BufReader};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use client::{Agent, FileBlobStore};
use nom::bytes::complete::tag;
use nom::character::complete::{alphanumeric1, multispace1};
use nom::sequence::preceded;
use nom::IResult;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

/// `send CONVERSATION_ID rest of the line is the message`, mirroring the
/// teacher's `message NAME MESSAGE` grammar.
#[derive(Debug)]
struct SendCommand {
    conversation_id: String,
    text: String,
}

fn parse_send(input: &str) -> IResult<&str, SendCommand> {
    let (input, _) = preceded(tag("send"), multispace1)(input)?;
    let (input, id) = alphanumeric1(input)?;
    let (text, _spaces) = multispace1(input)?;
    Ok((
        "",
        SendCommand {
            conversation_id: id.to_string(),
            text: text.to_string(),
        },
    ))
}

enum Line {
    Send(SendCommand),
    Create { id: String, members: Vec<String> },
    Add { id: String, member: String },
    Remove { id: String, member: String },
    Leave { id: String },
    Watch { id: String },
    Pair,
    Unknown(String),
}

fn parse_line(line: &str) -> Line {
    if let Ok((_, cmd)) = parse_send(line) {
        return Line::Send(cmd);
    }
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("create") => {
            let id = parts.next().unwrap_or_default().to_string();
            let members = parts.next().map(|m| m.split(',').map(str::to_string).collect()).unwrap_or_default();
            Line::Create { id, members }
        }
        Some("add") => Line::Add {
            id: parts.next().unwrap_or_default().to_string(),
            member: parts.next().unwrap_or_default().to_string(),
        },
        Some("remove") => Line::Remove {
            id: parts.next().unwrap_or_default().to_string(),
            member: parts.next().unwrap_or_default().to_string(),
        },
        Some("leave") => Line::Leave {
            id: parts.next().unwrap_or_default().to_string(),
        },
        Some("watch") => Line::Watch {
            id: parts.next().unwrap_or_default().to_string(),
        },
        Some("pair") => Line::Pair,
        _ => Line::Unknown(line.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = env::args().collect::<Vec<String>>();
    let relay_addr = args.get(1).cloned().unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

    let store_path = FileBlobStore::default_path("moltdm_client")?;
    let store = Box::new(FileBlobStore::open(store_path)?);
    let agent = Arc::new(Agent::load_or_register(store, relay_addr).await.context("registering with relay")?);

    eprintln!("Registered as {}", agent.moltbot_id());
    println!("create ID MEMBER1,MEMBER2 | send ID TEXT | add ID MEMBER | remove ID MEMBER | leave ID | watch ID | pair");

    let (tx, mut rx) = mpsc::unbounded_channel::<Line>();
    thread::spawn(move || {
        let lines = BufReader::new(stdin()).lines();
        for line in lines {
            let Ok(line) = line else { return };
            if tx.send(parse_line(&line)).is_err() {
                return;
            }
        }
    });

    let mut watched: Option<String> = None;
    let mut since_millis: i64 = 0;
    let mut ticker = interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(Line::Send(cmd)) => {
                        match agent.send_message(&cmd.conversation_id, cmd.text.as_bytes()).await {
                            Ok(_) => println!("sent."),
                            Err(e) => eprintln!("send failed: {e}"),
                        }
                    }
                    Some(Line::Create { id, members }) => {
                        match agent.create_conversation(&id, &members).await {
                            Ok(()) => println!("created {id}."),
                            Err(e) => eprintln!("create failed: {e}"),
                        }
                    }
                    Some(Line::Add { id, member }) => {
                        match agent.add_member(&id, &member).await {
                            Ok(()) => println!("added {member} to {id}."),
                            Err(e) => eprintln!("add failed: {e}"),
                        }
                    }
                    Some(Line::Remove { id, member }) => {
                        match agent.remove_member(&id, &member).await {
                            Ok(()) => println!("removed {member} from {id}."),
                            Err(e) => eprintln!("remove failed: {e}"),
                        }
                    }
                    Some(Line::Leave { id }) => {
                        match agent.leave_conversation(&id).await {
                            Ok(()) => println!("left {id}."),
                            Err(e) => eprintln!("leave failed: {e}"),
                        }
                    }
                    Some(Line::Watch { id }) => {
                        watched = Some(id.clone());
                        since_millis = 0;
                        println!("watching {id}.");
                    }
                    Some(Line::Pair) => {
                        match agent.initiate_pairing().await {
                            Ok(token) => println!("pairing token: {token} (moltbotId: {})", agent.moltbot_id()),
                            Err(e) => eprintln!("pair failed: {e}"),
                        }
                    }
                    Some(Line::Unknown(line)) => eprintln!("unrecognized command: {line}"),
                    None => {
                        eprintln!("closing...");
                        return Ok(());
                    }
                }
            }
            _ = ticker.tick() => {
                if let Some(id) = &watched {
                    match agent.poll_and_decrypt(id, since_millis).await {
                        Ok(messages) => {
                            for (message, plaintext) in messages {
                                since_millis = since_millis.max(message.created_at);
                                println!("[{}] {}: {}", id, message.from_id, String::from_utf8_lossy(&plaintext));
                            }
                        }
                        Err(e) => eprintln!("poll failed: {e}"),
                    }
                }
            }
        }
    }
}
