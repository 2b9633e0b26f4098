// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout};

use cedar_goto_elements::camera_trait::DeviceHandle;
use cedar_goto_elements::coords::HorizontalPosition;
use cedar_goto_elements::errors::DeviceError;
use cedar_goto_elements::mount_trait::PointingDevice;

// Alt-az mount speaking the Meade LX200 protocol over TCP (e.g. a WiFi
// serial bridge or a mount's own network port).
pub struct Lx200Mount {
    address: String,
    stream: Option<BufStream<TcpStream>>,

    // Limit for any single command/response exchange.
    io_timeout: Duration,

    // How often to ask whether a slew is still underway.
    poll_interval: Duration,
}

impl Lx200Mount {
    pub fn new(address: &str) -> Self {
        Lx200Mount {
            address: address.to_string(),
            stream: None,
            io_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    // (Re)establishes the TCP connection, dropping any previous one along
    // with whatever unread replies it held.
    async fn open(&mut self) -> Result<(), DeviceError> {
        self.stream = None;
        let stream = match timeout(self.io_timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(DeviceError::HardwareFault(
                    format!("cannot connect to {}: {}", self.address, e)));
            }
            Err(_) => return Err(DeviceError::Timeout),
        };
        self.stream = Some(BufStream::new(stream));
        Ok(())
    }

    fn stream(&mut self) -> Result<&mut BufStream<TcpStream>, DeviceError> {
        self.stream.as_mut().ok_or(DeviceError::NotConnected)
    }

    async fn send(&mut self, command: &str) -> Result<(), DeviceError> {
        debug!("LX200 <- {}", command);
        let io_timeout = self.io_timeout;
        let stream = self.stream()?;
        let write = async {
            stream.write_all(command.as_bytes()).await?;
            stream.flush().await
        };
        match timeout(io_timeout, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DeviceError::HardwareFault(format!("write: {}", e))),
            Err(_) => Err(DeviceError::Timeout),
        }
    }

    // Single character reply, as for the :S* and :MA commands.
    async fn read_char(&mut self) -> Result<u8, DeviceError> {
        let io_timeout = self.io_timeout;
        let stream = self.stream()?;
        match timeout(io_timeout, stream.read_u8()).await {
            Ok(Ok(c)) => Ok(c),
            Ok(Err(e)) => Err(DeviceError::HardwareFault(format!("read: {}", e))),
            Err(_) => Err(DeviceError::Timeout),
        }
    }

    // Reply terminated by '#', returned without the terminator.
    async fn read_reply(&mut self) -> Result<String, DeviceError> {
        let io_timeout = self.io_timeout;
        let stream = self.stream()?;
        let mut reply = Vec::new();
        match timeout(io_timeout, stream.read_until(b'#', &mut reply)).await {
            Ok(Ok(0)) => {
                return Err(DeviceError::HardwareFault("connection closed".to_string()));
            }
            Ok(Ok(_)) => (),
            Ok(Err(e)) => {
                return Err(DeviceError::HardwareFault(format!("read: {}", e)));
            }
            Err(_) => return Err(DeviceError::Timeout),
        }
        if reply.last() == Some(&b'#') {
            reply.pop();
        }
        let reply = String::from_utf8_lossy(&reply).to_string();
        debug!("LX200 -> {:?}", reply);
        Ok(reply)
    }

    async fn query(&mut self, command: &str) -> Result<String, DeviceError> {
        self.send(command).await?;
        self.read_reply().await
    }

    async fn set_target(&mut self, command: String, what: &str)
                        -> Result<(), DeviceError> {
        self.send(&command).await?;
        match self.read_char().await? {
            b'1' => Ok(()),
            _ => Err(DeviceError::Rejected(format!("mount refused {} {}", what, command))),
        }
    }

    async fn is_slewing(&mut self) -> Result<bool, DeviceError> {
        // Distance bars: empty once the slew is complete.
        Ok(!self.query(":D#").await?.is_empty())
    }

    // Polls until the slew completes (true) or `settle_timeout` passes
    // (false). The deadline is only checked between exchanges so that no
    // reply is left unread.
    async fn wait_for_slew(&mut self, settle_timeout: Duration)
                           -> Result<bool, DeviceError> {
        let deadline = Instant::now() + settle_timeout;
        loop {
            if !self.is_slewing().await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    // Stops a slew whose progress can no longer be followed. The exchange
    // that failed may still be answered later, so the connection is replaced
    // to keep replies paired with their commands.
    async fn abort_slew(&mut self) {
        let stopped = match self.send(":Q#").await {
            Ok(()) => true,
            Err(e) => {
                warn!("Stop command failed: {}", e);
                false
            }
        };
        if let Err(e) = self.open().await {
            warn!("Cannot reconnect to mount: {}", e);
            return;
        }
        if !stopped {
            if let Err(e) = self.send(":Q#").await {
                warn!("Stop command failed after reconnect: {}", e);
            }
        }
    }
}

#[async_trait]
impl PointingDevice for Lx200Mount {
    async fn connect(&mut self) -> Result<DeviceHandle, DeviceError> {
        self.open().await?;
        // Not every LX200 dialect answers the product query.
        let description = match self.query(":GVP#").await {
            Ok(product) if !product.is_empty() => product,
            Ok(_) => "LX200".to_string(),
            Err(e) => {
                warn!("No product name from mount: {}", e);
                "LX200".to_string()
            }
        };
        info!("Connected to {} at {}", description, self.address);
        Ok(DeviceHandle{name: format!("lx200:{}", self.address), description})
    }

    async fn slew_to(&mut self, target: &HorizontalPosition,
                     settle_timeout: Duration) -> Result<(), DeviceError> {
        self.set_target(format!(":Sa{}#", format_altitude(target.altitude())),
                        "altitude").await?;
        self.set_target(format!(":Sz{}#", format_azimuth(target.azimuth())),
                        "azimuth").await?;
        self.send(":MA#").await?;
        let reply = self.read_char().await?;
        if reply != b'0' {
            return Err(DeviceError::Rejected(
                format!("slew refused (reply {:?})", reply as char)));
        }
        match self.wait_for_slew(settle_timeout).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!("Slew did not settle within {:?}; stopping mount", settle_timeout);
                if let Err(e) = self.send(":Q#").await {
                    warn!("Stop command failed: {}", e);
                }
                Err(DeviceError::Timeout)
            }
            Err(e) => {
                warn!("Lost contact during slew ({}); stopping mount", e);
                self.abort_slew().await;
                Err(e)
            }
        }
    }

    async fn current_position(&mut self) -> Result<HorizontalPosition, DeviceError> {
        let alt_reply = self.query(":GA#").await?;
        let az_reply = self.query(":GZ#").await?;
        let (Some(alt), Some(az)) = (parse_lx200_angle(&alt_reply),
                                     parse_lx200_angle(&az_reply)) else {
            return Err(DeviceError::HardwareFault(
                format!("unparseable position {:?} {:?}", alt_reply, az_reply)));
        };
        Ok(HorizontalPosition::new(alt, az))
    }

    async fn disconnect(&mut self) -> Result<(), DeviceError> {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                return Err(DeviceError::HardwareFault(format!("shutdown: {}", e)));
            }
            info!("Disconnected from {}", self.address);
        }
        Ok(())
    }
}

// Degrees to (degrees, minutes, seconds) of the magnitude, rounded to the
// nearest arcsecond without ever yielding 60 minutes or seconds.
fn to_dms(deg: f64) -> (i64, i64, i64) {
    let total = (deg.abs() * 3600.0).round() as i64;
    (total / 3600, (total / 60) % 60, total % 60)
}

// sDD*MM:SS
pub fn format_altitude(alt: f64) -> String {
    let (d, m, s) = to_dms(alt.clamp(-90.0, 90.0));
    let sign = if alt < 0.0 && (d, m, s) != (0, 0, 0) { '-' } else { '+' };
    format!("{}{:02}*{:02}:{:02}", sign, d, m, s)
}

// DDD*MM:SS
pub fn format_azimuth(az: f64) -> String {
    let (d, m, s) = to_dms(az.rem_euclid(360.0));
    // 359°59'59.6" rounds up to a full circle.
    let d = d % 360;
    format!("{:03}*{:02}:{:02}", d, m, s)
}

// Parses replies like "+45*30'15", "-05*10", "123*04:05" or "+45:30:15".
pub fn parse_lx200_angle(reply: &str) -> Option<f64> {
    let reply = reply.trim().trim_end_matches('#');
    let (negative, body) = match reply.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, reply.strip_prefix('+').unwrap_or(reply)),
    };
    let mut fields = body.split(|c: char| matches!(c, '*' | ':' | '\'' | '\u{df}' | '\u{b0}'))
        .filter(|f| !f.is_empty());
    let degrees: f64 = fields.next()?.parse::<u32>().ok()? as f64;
    let minutes: f64 = match fields.next() {
        Some(m) => m.parse::<f64>().ok()?,
        None => 0.0,
    };
    let seconds: f64 = match fields.next() {
        Some(s) => s.parse::<f64>().ok()?,
        None => 0.0,
    };
    if fields.next().is_some() || minutes >= 60.0 || seconds >= 60.0 {
        return None;
    }
    let deg = degrees + minutes / 60.0 + seconds / 3600.0;
    Some(if negative { -deg } else { deg })
}
