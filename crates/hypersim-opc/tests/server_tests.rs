use hypersim_opc::protocol::{self, encode_message, encode_pixels};
use hypersim_opc::protocol::sysex::{CMD_COLOR_CORRECTION, SYSTEM_ID};
use hypersim_opc::{
    ColorCorrectionParams, FirmwareFlags, Frame, OpcError, OpcServer, OpcServerConfig, Pixel,
    PixelSink,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

struct ChannelSink {
    frames: UnboundedSender<Frame>,
    corrections: UnboundedSender<ColorCorrectionParams>,
}

impl PixelSink for ChannelSink {
    fn pixels_updated(&self, frame: &Frame) {
        let _ = self.frames.send(frame.clone());
    }

    fn color_correction_changed(&self, params: &ColorCorrectionParams) {
        let _ = self.corrections.send(*params);
    }
}

struct TestServer {
    server: OpcServer,
    frames: UnboundedReceiver<Frame>,
    corrections: UnboundedReceiver<ColorCorrectionParams>,
}

impl TestServer {
    async fn start(config: OpcServerConfig) -> Self {
        let (frames_tx, frames) = unbounded_channel();
        let (corrections_tx, corrections) = unbounded_channel();
        let sink = ChannelSink {
            frames: frames_tx,
            corrections: corrections_tx,
        };

        let server = OpcServer::start(config, Some(Arc::new(sink) as Arc<dyn PixelSink>))
            .await
            .expect("server should start");

        Self {
            server,
            frames,
            corrections,
        }
    }

    async fn start_default() -> Self {
        Self::start(OpcServerConfig::new(0).with_host("127.0.0.1")).await
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.server.local_addr())
            .await
            .expect("client should connect")
    }

    async fn next_frame(&mut self) -> Frame {
        timeout(WAIT, self.frames.recv())
            .await
            .expect("frame should arrive in time")
            .expect("sink channel open")
    }
}

fn pixels(frame: &Frame) -> Vec<(u8, u8, u8)> {
    frame.iter().map(|p| (p.r, p.g, p.b)).collect()
}

#[tokio::test]
async fn test_pixels_end_to_end() {
    let mut test = TestServer::start_default().await;
    let mut client = test.connect().await;

    client
        .write_all(&[0, 0, 0, 6, 10, 20, 30, 40, 50, 60])
        .await
        .unwrap();

    let frame = test.next_frame().await;
    assert_eq!(pixels(&frame), vec![(10, 20, 30), (40, 50, 60)]);
}

#[tokio::test]
async fn test_gamma_correction_end_to_end() {
    let mut test = TestServer::start_default().await;
    let mut client = test.connect().await;

    let body = br#"{"gamma":2.0,"whitepoint":[1,1,1]}"#;
    let sysex = protocol::encode_sysex(SYSTEM_ID, CMD_COLOR_CORRECTION, body).unwrap();
    client.write_all(&sysex).await.unwrap();

    let params = timeout(WAIT, test.corrections.recv()).await.unwrap().unwrap();
    assert_eq!(params, ColorCorrectionParams::new(2.0, [1.0, 1.0, 1.0]));

    let message = encode_pixels(0, &[Pixel::new(128, 10, 0)]).unwrap();
    client.write_all(&message).await.unwrap();

    let frame = test.next_frame().await;
    assert_eq!(pixels(&frame), vec![(255, 100, 0)]);
}

#[tokio::test]
async fn test_malformed_sysex_keeps_connection_open() {
    let mut test = TestServer::start_default().await;
    let mut client = test.connect().await;

    let sysex = protocol::encode_sysex(SYSTEM_ID, CMD_COLOR_CORRECTION, &[0xFF, 0xFE, 0xFD]).unwrap();
    client.write_all(&sysex).await.unwrap();
    client
        .write_all(&encode_pixels(0, &[Pixel::new(7, 8, 9)]).unwrap())
        .await
        .unwrap();

    let frame = test.next_frame().await;
    assert_eq!(pixels(&frame), vec![(7, 8, 9)]);
    assert!(test.corrections.try_recv().is_err());
    assert_eq!(
        test.server.color_corrector().params(),
        ColorCorrectionParams::default()
    );
}

#[tokio::test]
async fn test_unknown_command_does_not_close_connection() {
    let mut test = TestServer::start_default().await;
    let mut client = test.connect().await;

    client
        .write_all(&encode_message(0, 0x7F, &[1, 2, 3, 4]).unwrap())
        .await
        .unwrap();
    client
        .write_all(&encode_pixels(0, &[Pixel::new(1, 1, 1)]).unwrap())
        .await
        .unwrap();

    let frame = test.next_frame().await;
    assert_eq!(pixels(&frame), vec![(1, 1, 1)]);
}

#[tokio::test]
async fn test_firmware_flags_end_to_end() {
    let mut test = TestServer::start_default().await;
    let mut client = test.connect().await;

    let flags = FirmwareFlags {
        disable_interpolation: true,
        manual_led_control: true,
        ..Default::default()
    };
    client.write_all(&flags.to_message().unwrap()).await.unwrap();
    // Pixel frame afterwards proves the sysEx was processed first
    client
        .write_all(&encode_pixels(0, &[Pixel::new(0, 0, 0)]).unwrap())
        .await
        .unwrap();
    test.next_frame().await;

    assert_eq!(test.server.dispatcher().firmware_flags(), flags);
}

#[tokio::test]
async fn test_multiple_connections_share_state() {
    let mut test = TestServer::start_default().await;
    let mut first = test.connect().await;
    let mut second = test.connect().await;

    let params = ColorCorrectionParams::new(1.0, [0.5, 0.5, 0.5]);
    first.write_all(&params.to_message().unwrap()).await.unwrap();
    timeout(WAIT, test.corrections.recv()).await.unwrap().unwrap();

    second
        .write_all(&encode_pixels(0, &[Pixel::new(200, 100, 50)]).unwrap())
        .await
        .unwrap();

    let frame = test.next_frame().await;
    assert_eq!(pixels(&frame), vec![(100, 50, 25)]);
}

#[tokio::test]
async fn test_standby_defers_pixels_and_drops_corrections() {
    let mut test = TestServer::start_default().await;
    let mut pixel_client = test.connect().await;
    let mut control_client = test.connect().await;

    let guard = test.server.standby().await.unwrap();

    // Blocks its connection on the gate until release
    pixel_client
        .write_all(&encode_pixels(0, &[Pixel::new(5, 5, 5)]).unwrap())
        .await
        .unwrap();
    // Reaches the dispatcher while standby is engaged
    let params = ColorCorrectionParams::new(2.0, [1.0, 1.0, 1.0]);
    control_client
        .write_all(&params.to_message().unwrap())
        .await
        .unwrap();

    assert!(timeout(Duration::from_millis(200), test.frames.recv())
        .await
        .is_err());

    drop(guard);

    let frame = test.next_frame().await;
    assert_eq!(pixels(&frame), vec![(5, 5, 5)]);

    assert!(test.corrections.try_recv().is_err());
    assert_eq!(
        test.server.color_corrector().params(),
        ColorCorrectionParams::default()
    );
}

#[tokio::test]
async fn test_standby_twice_times_out() {
    let config = OpcServerConfig::new(0)
        .with_host("127.0.0.1")
        .with_standby_timeout(Duration::from_millis(50));
    let test = TestServer::start(config).await;

    let _guard = test.server.standby().await.unwrap();
    let result = test.server.standby().await;
    assert!(matches!(result, Err(OpcError::LockTimeout(_))));
}

#[tokio::test]
async fn test_idle_connection_closed_after_timeout() {
    let config = OpcServerConfig::new(0)
        .with_host("127.0.0.1")
        .with_read_timeout(Duration::from_millis(100));
    let test = TestServer::start(config).await;
    let mut client = test.connect().await;

    let mut buf = [0u8; 1];
    let read = timeout(WAIT, client.read(&mut buf))
        .await
        .expect("server should close the idle connection");
    assert_eq!(read.unwrap_or(0), 0);
}

#[tokio::test]
async fn test_stop_closes_connections_and_listener() {
    let test = TestServer::start_default().await;
    let addr = test.server.local_addr();
    let mut client = test.connect().await;

    test.server.stop();
    test.server.stop();
    timeout(WAIT, test.server.stopped())
        .await
        .expect("server should stop promptly");
    assert!(!test.server.is_running());

    let mut buf = [0u8; 1];
    let read = timeout(WAIT, client.read(&mut buf)).await.unwrap();
    assert_eq!(read.unwrap_or(0), 0);

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_port_in_use_is_bind_error() {
    let test = TestServer::start_default().await;
    let port = test.server.local_addr().port();

    let result = OpcServer::start(OpcServerConfig::new(port).with_host("127.0.0.1"), None).await;
    assert!(matches!(result, Err(OpcError::BindError { .. })));
}
