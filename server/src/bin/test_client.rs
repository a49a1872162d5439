use shared::{
    msg_type, Connect, Connected, Disconnect, Disconnected, Frame, FrameDecoder, Heartbeat, Talk,
    WireMessage, CLIENT_VERSION,
};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

// Get current timestamp in milliseconds
fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

async fn read_frame(
    stream: &mut TcpStream,
    decoder: &mut FrameDecoder,
) -> Result<Frame, Box<dyn std::error::Error>> {
    loop {
        if let Some(frame) = decoder.next_frame()? {
            return Ok(frame);
        }
        if stream.read_buf(decoder.buffer_mut()).await? == 0 {
            return Err("server closed the connection".into());
        }
    }
}

fn describe(frame: &Frame) -> String {
    match frame.type_id {
        msg_type::CONNECTED => format!("{:?}", Connected::from_frame(frame)),
        msg_type::HEARTBEAT => format!("{:?}", Heartbeat::from_frame(frame)),
        msg_type::DISCONNECTED => format!("{:?}", Disconnected::from_frame(frame)),
        msg_type::TALK => format!("{:?}", Talk::from_frame(frame)),
        other => format!("unknown type {} ({} bytes)", other, frame.payload.len()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server_addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:5816".to_string());

    println!("Connecting to {}", server_addr);
    let mut stream = TcpStream::connect(&server_addr).await?;
    println!("Connected from {}", stream.local_addr()?);
    let mut decoder = FrameDecoder::new();

    // Handshake
    let connect = Connect {
        client_version: CLIENT_VERSION,
    };
    stream.write_all(&connect.encode()?).await?;
    println!("Sent {:?}", connect);

    let frame = read_frame(&mut stream, &mut decoder).await?;
    let client_id = match Connected::from_frame(&frame) {
        Ok(connected) => connected.client_id,
        Err(_) => {
            println!("Expected Connected but got: {}", describe(&frame));
            return Ok(());
        }
    };
    println!("Connection accepted with client ID: {}", client_id);

    // Heartbeats, one per second
    for _ in 0..3 {
        let heartbeat = Heartbeat {
            timestamp: get_timestamp(),
        };
        stream.write_all(&heartbeat.encode()?).await?;

        match timeout(Duration::from_secs(2), read_frame(&mut stream, &mut decoder)).await {
            Ok(Ok(frame)) => println!("Received {}", describe(&frame)),
            Ok(Err(e)) => println!("Error receiving heartbeat: {}", e),
            Err(_) => println!("No heartbeat echo within 2s"),
        }
        sleep(Duration::from_secs(1)).await;
    }

    // Chat to everyone, which includes ourselves
    let talk = Talk {
        sender: String::new(),
        recipient: String::new(),
        text: format!("hello from client {}", client_id),
    };
    stream.write_all(&talk.encode()?).await?;
    if let Ok(Ok(frame)) = timeout(Duration::from_secs(2), read_frame(&mut stream, &mut decoder)).await {
        println!("Received {}", describe(&frame));
    }

    println!("Sending disconnect request");
    stream.write_all(&Disconnect.encode()?).await?;

    let mut rest = Vec::new();
    let _ = timeout(Duration::from_secs(2), stream.read_to_end(&mut rest)).await;
    println!("Test client finished");

    Ok(())
}
