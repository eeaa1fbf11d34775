//! `std::io` adapters over the ESP-IDF UART driver.

use std::io;

use anyhow::Result;
use esp_idf_svc::hal::{
    delay::{TickType, BLOCK},
    gpio::{AnyIOPin, InputPin, OutputPin},
    peripheral::Peripheral,
    uart::{config, Uart, UartDriver, UartRxDriver, UartTxDriver},
    units::Hertz,
};
use log::info;

use lota_core::{FlowControl, Parity, SerialConfig};

/// Read timeout. Quiet periods this long release held-back marker bytes.
const READ_TIMEOUT_MS: u64 = 100;

/// Receive half. An idle line reads as [`io::ErrorKind::TimedOut`].
pub struct UartReader {
    rx: UartRxDriver<'static>,
    timeout: u32,
}

impl io::Read for UartReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.rx.read(buf, self.timeout) {
            Ok(0) => Err(io::Error::new(io::ErrorKind::TimedOut, "uart idle")),
            Ok(n) => Ok(n),
            Err(e) => Err(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}

/// Transmit half.
pub struct UartWriter {
    tx: UartTxDriver<'static>,
}

impl io::Write for UartWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .write(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tx
            .wait_done(BLOCK)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

/// Install the UART driver with `config` and split it into halves.
pub fn open_uart<U: Uart>(
    config: &SerialConfig,
    uart: impl Peripheral<P = U> + 'static,
    tx: impl Peripheral<P = impl OutputPin> + 'static,
    rx: impl Peripheral<P = impl InputPin> + 'static,
) -> Result<(UartReader, UartWriter)> {
    let data_bits = match config.data_bits {
        5 => config::DataBits::DataBits5,
        6 => config::DataBits::DataBits6,
        7 => config::DataBits::DataBits7,
        _ => config::DataBits::DataBits8,
    };
    let parity = match config.parity {
        Parity::None => config::Parity::ParityNone,
        Parity::Odd => config::Parity::ParityOdd,
        Parity::Even => config::Parity::ParityEven,
    };
    let stop_bits = match config.stop_bits {
        2 => config::StopBits::STOP2,
        _ => config::StopBits::STOP1,
    };
    let flow_control = match config.flow_control {
        FlowControl::Hardware => config::FlowControl::RTSCTS,
        FlowControl::None | FlowControl::Software => config::FlowControl::None,
    };

    let uart_config = config::Config::default()
        .baudrate(Hertz(config.baud_rate))
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
        .rx_fifo_size(config.rx_buffer_size)
        .queue_size(config.event_queue_len);

    let driver = UartDriver::new(
        uart,
        tx,
        rx,
        Option::<AnyIOPin>::None,
        Option::<AnyIOPin>::None,
        &uart_config,
    )?;
    info!("UART up at {} baud", config.baud_rate);

    let (tx, rx) = driver.into_split();
    Ok((
        UartReader {
            rx,
            timeout: TickType::new_millis(READ_TIMEOUT_MS).ticks(),
        },
        UartWriter { tx },
    ))
}
