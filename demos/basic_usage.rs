//! Basic usage example for the Postern SMTP server
//!
//! Starts a server whose directory knows one recipient, talks to it over a plain TCP
//! socket, and prints what ended up in the store.

use postern::{MemoryStore, SmtpServer};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Postern Basic Usage Example");
    println!("===========================");

    let store = Arc::new(MemoryStore::with_users(["recipient@example.com"]));
    let server = SmtpServer::new("example.local", store.clone(), store.clone());
    let shutdown = server.shutdown_handle();
    println!("Created SMTP server with hostname: example.local");

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();
    let server_thread = thread::spawn(move || {
        if let Err(e) = server.start_with_listener(listener) {
            eprintln!("Server error: {e}");
        }
    });
    println!("Server started on {addr}");

    println!("\nSending test email...");
    send_email(
        &addr,
        "recipient@example.com",
        &[
            "From: sender@example.com",
            "To: recipient@example.com",
            "Subject: Test Email from Postern",
            "",
            "A line holding a single period follows.",
            ".",
            "It is part of the body, not the end of it.",
        ],
    )?;

    println!("\nSending email to an unknown recipient...");
    send_email(&addr, "stranger@example.com", &["Subject: Lost", "", "Nobody reads this."])?;

    println!("\nStored {} message(s):", store.len());
    for message in store.messages() {
        println!("  #{} {} -> {}", message.id, message.email.from, message.email.to);
        if let Some(subject) = message.email.get_subject() {
            println!("  Subject: {subject}");
        }
        for line in message.email.data.lines() {
            println!("    {line}");
        }
    }

    shutdown.trigger();
    server_thread.join().ok();
    Ok(())
}

/// Walk through one session, printing every reply
fn send_email(
    addr: &str,
    recipient: &str,
    lines: &[&str],
) -> Result<(), Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(addr)?;
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut response = String::new();

    reader.read_line(&mut response)?;
    print!("S: {response}");

    for command in [
        "HELO client.example.com".to_string(),
        "MAIL FROM:<sender@example.com>".to_string(),
        format!("RCPT TO:<{recipient}>"),
    ] {
        println!("C: {command}");
        write!(stream, "{command}\r\n")?;
        response.clear();
        reader.read_line(&mut response)?;
        print!("S: {response}");
        if !response.starts_with('2') {
            return Ok(());
        }
    }

    write!(stream, "DATA\r\n")?;
    response.clear();
    reader.read_line(&mut response)?;
    print!("S: {response}");

    // One write, so the interior "." line cannot land at the end of a read
    let mut body: String = lines.iter().map(|line| format!("{line}\r\n")).collect();
    body.push_str(".\r\n");
    stream.write_all(body.as_bytes())?;
    response.clear();
    reader.read_line(&mut response)?;
    print!("S: {response}");

    write!(stream, "QUIT\r\n")?;
    response.clear();
    reader.read_line(&mut response)?;
    print!("S: {response}");

    Ok(())
}
