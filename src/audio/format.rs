//! 样本格式和 PCM 视图
//!
//! 客户端协商的格式在 prepare 之后不可变。
//! 内部解码表示：所有位深统一左对齐到 i32 的高位
//! - 8-bit: 占据 bit[31:24]
//! - 16-bit: 占据 bit[31:16]
//! - float: 缩放到 i32 满量程

/// 字节序
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// 客户端样本格式
///
/// 顺序与线上协议的格式序号一致（U8 = 0 ... F32BE = 4）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    U8,
    S16LE,
    S16BE,
    F32LE,
    F32BE,
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self::U8
    }
}

impl SampleFormat {
    /// 从线上协议序号解析
    pub fn from_wire(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::U8),
            1 => Some(Self::S16LE),
            2 => Some(Self::S16BE),
            3 => Some(Self::F32LE),
            4 => Some(Self::F32BE),
            _ => None,
        }
    }

    /// 线上协议序号
    pub fn wire_index(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::S16LE => 1,
            Self::S16BE => 2,
            Self::F32LE => 3,
            Self::F32BE => 4,
        }
    }

    /// 每样本字节数
    #[inline]
    pub fn byte_width(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16LE | Self::S16BE => 2,
            Self::F32LE | Self::F32BE => 4,
        }
    }

    /// 样本字节序，U8 无字节序
    #[inline]
    pub fn byte_order(self) -> Option<ByteOrder> {
        match self {
            Self::U8 => None,
            Self::S16LE | Self::F32LE => Some(ByteOrder::Little),
            Self::S16BE | Self::F32BE => Some(ByteOrder::Big),
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Self::F32LE | Self::F32BE)
    }

    /// 把 [-1.0, 1.0] 的样本按本格式编码追加到 `out`
    pub fn encode(self, sample: f32, out: &mut Vec<u8>) {
        let sample = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        match self {
            Self::U8 => out.push((sample * 127.0 + 128.0) as u8),
            Self::S16LE => out.extend_from_slice(&((sample * i16::MAX as f32) as i16).to_le_bytes()),
            Self::S16BE => out.extend_from_slice(&((sample * i16::MAX as f32) as i16).to_be_bytes()),
            Self::F32LE => out.extend_from_slice(&sample.to_le_bytes()),
            Self::F32BE => out.extend_from_slice(&sample.to_be_bytes()),
        }
    }

    /// 解码单个样本（左对齐到 i32）
    ///
    /// `bytes` 长度必须等于 `byte_width()`
    #[inline]
    fn decode(self, bytes: &[u8]) -> i32 {
        match self {
            // offset-binary：0x80 为零点
            Self::U8 => ((bytes[0] as i32) - 128) << 24,
            Self::S16LE => (i16::from_le_bytes([bytes[0], bytes[1]]) as i32) << 16,
            Self::S16BE => (i16::from_be_bytes([bytes[0], bytes[1]]) as i32) << 16,
            Self::F32LE => float_to_i32(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            Self::F32BE => float_to_i32(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        }
    }
}

#[inline]
fn float_to_i32(sample: f32) -> i32 {
    if sample.is_nan() {
        return 0;
    }
    let clamped = sample.clamp(-1.0, 1.0) as f64;
    (clamped * i32::MAX as f64) as i32
}

/// 流参数：格式协商的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamParams {
    pub format: SampleFormat,
    pub channels: u8,
    pub sample_rate: u32,
    /// 缓冲区帧数
    pub buffer_frames: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            format: SampleFormat::default(),
            channels: 2,
            sample_rate: 0,
            buffer_frames: 0,
        }
    }
}

impl StreamParams {
    pub fn new(format: SampleFormat, channels: u8, sample_rate: u32, buffer_frames: u32) -> Self {
        Self {
            format,
            channels,
            sample_rate,
            buffer_frames,
        }
    }

    /// 每帧的字节数
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.byte_width()
    }

    /// 缓冲区字节数
    #[inline]
    pub fn buffer_bytes(&self) -> usize {
        self.buffer_frames as usize * self.frame_bytes()
    }

    /// 缓冲区大小是否可用
    ///
    /// 只拦截零帧数和零宽度帧，不做额外的对齐要求
    pub fn has_valid_buffer(&self) -> bool {
        let frame_bytes = self.frame_bytes();
        frame_bytes > 0 && self.buffer_frames > 0 && self.buffer_bytes() % frame_bytes == 0
    }
}

/// 带格式标签的交织 PCM 数据
///
/// 只读视图：pacer 和 mirror 共享同一份数据，各自按标签解释，
/// 没有需要回绕的读位置。
#[derive(Clone, Copy, Debug)]
pub struct PcmView<'a> {
    bytes: &'a [u8],
    params: StreamParams,
}

impl<'a> PcmView<'a> {
    /// 创建视图，尾部不足一帧的字节被截掉
    pub fn new(bytes: &'a [u8], params: StreamParams) -> Self {
        let frame_bytes = params.frame_bytes();
        let usable = if frame_bytes == 0 {
            0
        } else {
            bytes.len() / frame_bytes * frame_bytes
        };
        Self {
            bytes: &bytes[..usable],
            params,
        }
    }

    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    #[inline]
    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    #[inline]
    pub fn byte_order(&self) -> Option<ByteOrder> {
        self.params.format.byte_order()
    }

    /// 帧数
    #[inline]
    pub fn frames(&self) -> usize {
        match self.params.frame_bytes() {
            0 => 0,
            fb => self.bytes.len() / fb,
        }
    }

    /// 样本总数（帧数 × 声道数）
    #[inline]
    pub fn samples(&self) -> usize {
        self.frames() * self.params.channels as usize
    }

    /// 按格式标签解码第 `index` 个样本，与主机字节序无关
    pub fn sample(&self, index: usize) -> Option<i32> {
        let width = self.params.format.byte_width();
        let start = index.checked_mul(width)?;
        let bytes = self.bytes.get(start..start + width)?;
        Some(self.params.format.decode(bytes))
    }

    /// 将样本解码到 `output`，返回写入的样本数
    pub fn decode_into(&self, output: &mut [i32]) -> usize {
        let width = self.params.format.byte_width();
        let mut count = 0;
        for (chunk, out) in self.bytes.chunks_exact(width).zip(output.iter_mut()) {
            *out = self.params.format.decode(chunk);
            count += 1;
        }
        count
    }

    /// 峰值电平（绝对值，左对齐 i32 量程）
    pub fn peak(&self) -> u32 {
        let width = self.params.format.byte_width();
        self.bytes
            .chunks_exact(width)
            .map(|chunk| self.params.format.decode(chunk).unsigned_abs())
            .max()
            .unwrap_or(0)
    }
}
