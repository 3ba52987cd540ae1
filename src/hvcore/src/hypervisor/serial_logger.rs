//! A `log` sink writing to the COM1 serial port, the only output the
//! hypervisor has.

use core::fmt::Write;
use spin::Mutex;

static LOGGER: UartLogger = UartLogger::new(UartComPort::Com1);

/// Sets up the UART and installs it as the logger. Does nothing if a logger
/// is already installed.
pub(crate) fn init(level: log::LevelFilter) {
    LOGGER.init();
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

struct UartLogger {
    port: Mutex<Uart>,
}

impl UartLogger {
    const fn new(port: UartComPort) -> Self {
        Self {
            port: Mutex::new(Uart::new(port)),
        }
    }

    fn init(&self) {
        self.port.lock().init(UartBaudRate::Baud115200);
    }
}

impl log::Log for UartLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            let _ = write!(
                self.port.lock(),
                "{:>5}: {}\r\n",
                record.level(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

#[derive(Clone, Copy)]
#[repr(u16)]
enum UartComPort {
    Com1 = 0x3f8,
}

#[derive(Clone, Copy)]
enum UartBaudRate {
    Baud115200 = 115_200,
}

/// A 16550 compatible UART.
struct Uart {
    io_port_base: u16,
}

impl Uart {
    const fn new(com: UartComPort) -> Self {
        Self {
            io_port_base: com as u16,
        }
    }

    /// Configures 8 data bits, no parity, one stop bit, FIFOs on and
    /// interrupts off.
    fn init(&self, baud_rate: UartBaudRate) {
        const UART_OFFSET_DIVISOR_LATCH_LOW: u16 = 0;
        const UART_OFFSET_INTERRUPT_ENABLE: u16 = 1;
        const UART_OFFSET_DIVISOR_LATCH_HIGH: u16 = 1;
        const UART_OFFSET_FIFO_CONTROL: u16 = 2;
        const UART_OFFSET_LINE_CONTROL: u16 = 3;
        const UART_OFFSET_MODEM_CONTROL: u16 = 4;

        outb(self.io_port_base + UART_OFFSET_INTERRUPT_ENABLE, 0x00);
        outb(self.io_port_base + UART_OFFSET_LINE_CONTROL, 0x80);

        let divider = 115_200 / (baud_rate as u32);
        outb(
            self.io_port_base + UART_OFFSET_DIVISOR_LATCH_LOW,
            divider as u8,
        );
        outb(
            self.io_port_base + UART_OFFSET_DIVISOR_LATCH_HIGH,
            (divider >> 8) as u8,
        );
        outb(self.io_port_base + UART_OFFSET_LINE_CONTROL, 0x03);
        outb(self.io_port_base + UART_OFFSET_FIFO_CONTROL, 0xc7);
        outb(self.io_port_base + UART_OFFSET_MODEM_CONTROL, 0x0b);
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        const UART_OFFSET_LINE_STATUS: u16 = 5;
        const UART_OFFSET_TRANSMITTER_HOLDING_BUFFER: u16 = 0;
        const LINE_STATUS_TRANSMITTER_EMPTY: u8 = 0x20;

        for c in s.bytes() {
            while inb(self.io_port_base + UART_OFFSET_LINE_STATUS) & LINE_STATUS_TRANSMITTER_EMPTY
                == 0
            {
                core::hint::spin_loop();
            }
            outb(
                self.io_port_base + UART_OFFSET_TRANSMITTER_HOLDING_BUFFER,
                c,
            );
        }
        Ok(())
    }
}

fn outb(port: u16, data: u8) {
    unsafe { x86::io::outb(port, data) };
}

fn inb(port: u16) -> u8 {
    unsafe { x86::io::inb(port) }
}
