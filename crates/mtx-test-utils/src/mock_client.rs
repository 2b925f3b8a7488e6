use futures_util::{SinkExt, StreamExt};
use mtx_protocol::{
    Announce, Describe, Frame, Play, Record, SetupPlay, Teardown, TrackInfo, WireMessage,
};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use uuid::Uuid;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type Error = Box<dyn std::error::Error + Send + Sync>;

/// A relay-protocol peer for tests: connects, performs the hello handshake,
/// and can then act as either a publisher or a reader.
pub struct MockClient {
    ws: WsStream,
    pub session_id: String,
}

impl MockClient {
    /// Connect and consume the server's `hello`.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let (ws, _response) = tokio_tungstenite::connect_async(url).await?;
        let mut client = MockClient {
            ws,
            session_id: String::new(),
        };
        match client.recv_message().await? {
            WireMessage::Hello(hello) => client.session_id = hello.session_id,
            other => return Err(format!("expected hello, got {other:?}").into()),
        }
        Ok(client)
    }

    pub async fn send_message(&mut self, msg: &WireMessage) -> Result<(), Error> {
        let json = serde_json::to_string(msg)?;
        self.ws.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Next control message; binary frames received meanwhile are dropped.
    pub async fn recv_message(&mut self) -> Result<WireMessage, Error> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(serde_json::from_str(&text)?);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) -> Result<(), Error> {
        self.ws.send(Message::Binary(frame.encode())).await?;
        Ok(())
    }

    /// Next media frame; control messages received meanwhile are dropped.
    pub async fn recv_frame(&mut self) -> Result<Frame, Error> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Binary(buf))) => return Ok(Frame::decode(&buf)?),
                Some(Ok(Message::Text(_) | Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Error> {
        self.ws.send(Message::Close(None)).await?;
        Ok(())
    }

    fn request_id() -> String {
        Uuid::new_v4().to_string()
    }

    // -----------------------------------------------------------------------
    // Request helpers
    // -----------------------------------------------------------------------

    pub async fn describe(&mut self, path: &str) -> Result<WireMessage, Error> {
        self.describe_as(path, None, None).await
    }

    pub async fn describe_as(
        &mut self,
        path: &str,
        user: Option<&str>,
        pass: Option<&str>,
    ) -> Result<WireMessage, Error> {
        self.send_message(&WireMessage::Describe(Describe {
            request_id: Self::request_id(),
            path: path.to_owned(),
            user: user.map(str::to_owned),
            pass: pass.map(str::to_owned),
        }))
        .await?;
        self.recv_message().await
    }

    pub async fn announce(
        &mut self,
        path: &str,
        tracks: Vec<TrackInfo>,
    ) -> Result<WireMessage, Error> {
        self.announce_as(path, tracks, None, None).await
    }

    pub async fn announce_as(
        &mut self,
        path: &str,
        tracks: Vec<TrackInfo>,
        user: Option<&str>,
        pass: Option<&str>,
    ) -> Result<WireMessage, Error> {
        self.send_message(&WireMessage::Announce(Announce {
            request_id: Self::request_id(),
            path: path.to_owned(),
            tracks,
            user: user.map(str::to_owned),
            pass: pass.map(str::to_owned),
        }))
        .await?;
        self.recv_message().await
    }

    pub async fn setup_play(&mut self, path: &str, track_ids: Vec<u8>) -> Result<WireMessage, Error> {
        self.send_message(&WireMessage::SetupPlay(SetupPlay {
            request_id: Self::request_id(),
            path: path.to_owned(),
            track_ids,
            user: None,
            pass: None,
        }))
        .await?;
        self.recv_message().await
    }

    pub async fn play(&mut self) -> Result<WireMessage, Error> {
        self.send_message(&WireMessage::Play(Play {
            request_id: Self::request_id(),
        }))
        .await?;
        self.recv_message().await
    }

    pub async fn record(&mut self) -> Result<WireMessage, Error> {
        self.send_message(&WireMessage::Record(Record {
            request_id: Self::request_id(),
        }))
        .await?;
        self.recv_message().await
    }

    pub async fn teardown(&mut self) -> Result<WireMessage, Error> {
        self.send_message(&WireMessage::Teardown(Teardown {
            request_id: Self::request_id(),
        }))
        .await?;
        self.recv_message().await
    }

    // -----------------------------------------------------------------------
    // Whole-flow helpers
    // -----------------------------------------------------------------------

    /// Connect, announce `tracks` on `path` and transition to record.
    pub async fn publish(url: &str, path: &str, tracks: Vec<TrackInfo>) -> Result<Self, Error> {
        let mut client = Self::connect(url).await?;
        match client.announce(path, tracks).await? {
            WireMessage::AnnounceOk(_) => {}
            other => return Err(format!("announce failed: {other:?}").into()),
        }
        match client.record().await? {
            WireMessage::Ok(_) => {}
            other => return Err(format!("record failed: {other:?}").into()),
        }
        Ok(client)
    }

    /// Connect, set up every track on `path` and transition to play.
    /// Returns the client and the track list the server confirmed.
    pub async fn subscribe(url: &str, path: &str) -> Result<(Self, Vec<TrackInfo>), Error> {
        let mut client = Self::connect(url).await?;
        let tracks = match client.setup_play(path, Vec::new()).await? {
            WireMessage::SetupOk(ok) => ok.tracks,
            other => return Err(format!("setup_play failed: {other:?}").into()),
        };
        match client.play().await? {
            WireMessage::Ok(_) => {}
            other => return Err(format!("play failed: {other:?}").into()),
        }
        Ok((client, tracks))
    }
}
