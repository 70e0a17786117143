//! Actor-mailbox example: many senders post messages, one actor drains its
//! mailbox in batches.

use std::thread;
use std::time::Duration;
use turbo_mpsc::optimistic;

#[derive(Debug)]
enum Message {
    Greet(String),
    Add(i64),
    Shutdown,
}

fn main() {
    println!("Mailbox Example\n");

    const SENDERS: usize = 4;

    // The mailbox favors sender throughput: an optimistic send returns as
    // soon as another sender has taken charge of delivering it.
    let (mailbox, mut inbox) = optimistic();

    let mut senders = vec![];
    for id in 0..SENDERS {
        let mailbox = mailbox.clone();
        senders.push(thread::spawn(move || {
            mailbox.send(Message::Greet(format!("hello from sender {}", id)));
            for i in 0..5 {
                mailbox.send(Message::Add(i));
            }
        }));
    }

    let actor = thread::spawn(move || {
        let mut sum = 0i64;
        let mut greetings = 0usize;
        loop {
            match inbox.try_recv() {
                Ok(Message::Greet(text)) => {
                    println!("actor: {}", text);
                    greetings += 1;
                }
                Ok(Message::Add(n)) => sum += n,
                Ok(Message::Shutdown) => break,
                Err(_) => thread::sleep(Duration::from_millis(1)),
            }
        }
        (sum, greetings)
    });

    for s in senders {
        s.join().unwrap();
    }
    mailbox.send(Message::Shutdown);

    let (sum, greetings) = actor.join().unwrap();
    println!("\nactor saw {} greetings, sum = {}", greetings, sum);
}
