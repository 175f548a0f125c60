use futures::{SinkExt, StreamExt};
use log::{debug, info};
use shared::MAX_LINE_LENGTH;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};

pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(server_addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(server_addr).await?;
        info!("Connected to {}", stream.peer_addr()?);
        Ok(Client { stream })
    }

    /// Pipes `input` lines to the server and server lines to `output` until
    /// the round ends or the server hangs up
    pub async fn run<I, O>(self, input: I, mut output: O) -> io::Result<()>
    where
        I: AsyncRead + Unpin,
        O: AsyncWrite + Unpin,
    {
        let (reader, writer) = self.stream.into_split();
        let mut server_lines =
            FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut server_sink = FramedWrite::new(writer, LinesCodec::new());
        let mut user_lines =
            FramedRead::new(input, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let mut input_open = true;

        loop {
            tokio::select! {
                line = server_lines.next() => match line {
                    Some(Ok(line)) => {
                        output.write_all(line.as_bytes()).await?;
                        output.write_all(b"\n").await?;
                        output.flush().await?;
                        if shared::is_final(&line) {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(into_io(e)),
                    None => {
                        info!("Server closed the connection");
                        return Ok(());
                    }
                },
                line = user_lines.next(), if input_open => match line {
                    Some(Ok(line)) => server_sink.send(line).await.map_err(into_io)?,
                    Some(Err(e)) => return Err(into_io(e)),
                    None => {
                        debug!("Input closed, still listening");
                        input_open = false;
                    }
                },
            }
        }
    }
}

fn into_io(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_client_plays_until_game_ended() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = stream.into_split();
            let mut lines = BufReader::new(reader).lines();
            writer
                .write_all(b"Welcome to Ascii drawing!\nPlease, enter your name:\n")
                .await
                .unwrap();
            let name = lines.next_line().await.unwrap().unwrap();
            let guess = lines.next_line().await.unwrap().unwrap();
            let reply = format!(
                "Player {} is the winner! The correct guess: {}.\nGame ended!\n",
                name, guess
            );
            writer.write_all(reply.as_bytes()).await.unwrap();
            // Keep the socket open; the client must stop on its own
            tokio::time::sleep(Duration::from_secs(2)).await;
        });

        let client = Client::connect(&addr).await.unwrap();
        let mut output = Vec::new();
        let input: &[u8] = b"foo\ncamel\n";

        assert_ok!(timeout(Duration::from_secs(1), client.run(input, &mut output))
            .await
            .unwrap());

        assert_eq!(
            String::from_utf8(output).unwrap(),
            "Welcome to Ascii drawing!\n\
             Please, enter your name:\n\
             Player foo is the winner! The correct guess: camel.\n\
             Game ended!\n"
        );
        server.abort();
    }

    #[tokio::test]
    async fn test_client_stops_when_server_hangs_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"Server is full.\n").await.unwrap();
        });

        let client = Client::connect(&addr).await.unwrap();
        let mut output = Vec::new();
        let input: &[u8] = b"";

        assert_ok!(timeout(Duration::from_secs(5), client.run(input, &mut output))
            .await
            .unwrap());
        assert_eq!(output, b"Server is full.\n");
    }
}
