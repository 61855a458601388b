//! Configuration of the data path, with defaults for both transports.
use embassy_time::Duration;

/// The physical transport between host and firmware.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transport {
    /// Zero-copy DMA. Receive buffers are handed to the firmware by address.
    #[default]
    Pcie,
    /// Copy-based. The firmware pushes frames into buffers owned by the bus driver.
    Sdio,
}

/// Configuration of the data path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HifConfig {
    pub transport: Transport,
    /// The number of buffers in each pool.
    pub pool_capacity: usize,
    /// The size of every pool buffer.
    pub buffer_size: usize,
    /// How many receive buffers should be handed to the device at any time.
    pub rx_buffer_target: usize,
    /// The number of addresses, after which an address batch is flushed.
    pub address_batch_capacity: usize,
    /// The number of bytes the bus driver prepends to every message.
    pub hif_offset: usize,
    /// Window size used for streams, which weren't set up with an explicit ADDBA.
    pub default_reorder_window: u16,
    pub max_reorder_streams: usize,
    /// How long a stalled reorder window waits for a missing frame.
    pub reorder_timeout: Duration,
    /// The number of forced releases after which a stream is considered lost.
    pub max_reorder_timeouts: u8,
    pub defrag_streams: usize,
    /// How long an incomplete fragment chain is kept.
    pub defrag_lifetime: Duration,
    /// Reassembled frames larger than this are discarded.
    pub max_frame_len: usize,
    /// Whether the firmware negotiated credit based flow control.
    pub credit_enabled: bool,
    /// The number of TX descriptors the firmware can hold.
    pub tx_budget: usize,
}
impl HifConfig {
    pub const COLOR_COUNT: usize = 4;
    pub const MAX_FRAMES_PER_REQUEST: usize = 64;
    pub const PCIE_MAX_RX_LEN: usize = 1676;
    pub const SDIO_MAX_RX_LEN: usize = 1592;
    pub const PCIE_MAX_TX_DESCRIPTORS: usize = 1024;

    /// The default configuration for PCIe.
    pub const fn pcie() -> Self {
        Self {
            transport: Transport::Pcie,
            pool_capacity: 1024,
            buffer_size: Self::PCIE_MAX_RX_LEN,
            rx_buffer_target: 800,
            address_batch_capacity: 200,
            hif_offset: 0,
            default_reorder_window: 64,
            max_reorder_streams: 16,
            reorder_timeout: Duration::from_millis(100),
            max_reorder_timeouts: 5,
            defrag_streams: 3,
            defrag_lifetime: Duration::from_millis(500),
            max_frame_len: 4096,
            credit_enabled: true,
            tx_budget: Self::PCIE_MAX_TX_DESCRIPTORS,
        }
    }
    /// The default configuration for SDIO.
    pub const fn sdio() -> Self {
        Self {
            transport: Transport::Sdio,
            pool_capacity: 0,
            buffer_size: Self::SDIO_MAX_RX_LEN,
            rx_buffer_target: 0,
            tx_budget: 256,
            ..Self::pcie()
        }
    }
    /// Limit the TX budget to the number of TX buffers, like the firmware does on PCIe.
    pub const fn with_tx_buffers(mut self, tx_buffers: usize) -> Self {
        if tx_buffers < self.tx_budget {
            self.tx_budget = tx_buffers;
        }
        self
    }
}
impl Default for HifConfig {
    fn default() -> Self {
        Self::pcie()
    }
}
