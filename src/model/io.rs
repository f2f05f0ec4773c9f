//! Model Container
//!
//! Reader for the binary weight container: a version word, a header array,
//! NUL-terminated names, i32 shapes, alignment padding, then the raw tensor
//! data. Prepared int8 weights carry one f32 quantization multiplier behind
//! their elements.
//!
//! While walking the entries the loader performs the int8 passes described
//! by the shared-embedding scheme: `Wemb` is dequantized to f32 and also
//! repacked as `Wemb_intgemm8` for the output projection; every other
//! quantized weight is re-tiled into owned aligned storage.
//!
//! A writer is included so fixtures and conversion tooling can produce the
//! same layout.

use byteorder::{ByteOrder, LittleEndian};
use tracing::debug;

use crate::error::Error;
use crate::mem::{AlignedBuf, MemoryMap};
use crate::qgemm;
use crate::tensor::{ElementType, Shape, Tensor};

/// Container version this loader understands.
pub const BINARY_FILE_VERSION: u64 = 1;

/// Data section alignment the writer maintains.
const DATA_ALIGNMENT: usize = 256;

// On-disk type codes: a size byte plus class bits.
const TYPE_INT8: u64 = 0x0101;
const TYPE_FLOAT32: u64 = 0x0404;
const TYPE_INTGEMM8: u64 = 0x4101;

struct Header {
    name_length: u64,
    ty: u64,
    shape_length: u64,
    data_length: u64,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| Error::MalformedModel("file truncated".into()))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u64(&mut self) -> Result<u64, Error> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    fn read_i32(&mut self) -> Result<i32, Error> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }
}

fn intercept(code: u64) -> Result<ElementType, Error> {
    match code {
        TYPE_INTGEMM8 => Ok(ElementType::Ig8),
        TYPE_INT8 => Ok(ElementType::I8),
        TYPE_FLOAT32 => Ok(ElementType::F32),
        other => Err(Error::MalformedModel(format!(
            "unsupported tensor type code {other:#x}"
        ))),
    }
}

fn unquantize_embedding(quantized: &[i8], multiplier: f32, out: &mut [f32]) {
    let inverse = 1.0 / multiplier;
    for (w, &q) in out.iter_mut().zip(quantized) {
        *w = q as f32 * inverse;
    }
}

/// Parse the container and hand back every entry as a named tensor, with the
/// int8 preparation passes applied. F32 entries stay as borrowed views into
/// the map; prepared weights own repacked copies.
pub fn load_items(map: &MemoryMap) -> Result<Vec<(String, Tensor)>, Error> {
    let shared = map.share();
    let mut reader = Reader::new(map.data());

    let version = reader.read_u64()?;
    if version != BINARY_FILE_VERSION {
        return Err(Error::MalformedModel(format!(
            "container version {version} != expected {BINARY_FILE_VERSION}"
        )));
    }

    let num_headers = reader.read_u64()? as usize;
    let mut headers = Vec::with_capacity(num_headers);
    for _ in 0..num_headers {
        headers.push(Header {
            name_length: reader.read_u64()?,
            ty: reader.read_u64()?,
            shape_length: reader.read_u64()?,
            data_length: reader.read_u64()?,
        });
    }

    let mut names = Vec::with_capacity(num_headers);
    for header in &headers {
        let raw = reader.take(header.name_length as usize)?;
        // Names are stored NUL-terminated.
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let name = std::str::from_utf8(&raw[..end])
            .map_err(|_| Error::MalformedModel("non-utf8 tensor name".into()))?;
        names.push(name.to_string());
    }

    let mut shapes = Vec::with_capacity(num_headers);
    for header in &headers {
        let mut dims = Vec::with_capacity(header.shape_length as usize);
        for _ in 0..header.shape_length {
            let dim = reader.read_i32()?;
            if dim <= 0 {
                return Err(Error::MalformedModel(format!("non-positive dimension {dim}")));
            }
            dims.push(dim as usize);
        }
        shapes.push(Shape::new(dims));
    }

    let padding = reader.read_u64()? as usize;
    reader.take(padding)?;

    let mut items: Vec<(String, Tensor)> = Vec::with_capacity(num_headers + 1);
    let mut embedding_processed: Option<(String, Tensor)> = None;

    for ((header, name), shape) in headers.iter().zip(names).zip(shapes) {
        let ty = intercept(header.ty)?;
        let data_length = header.data_length as usize;
        let offset = reader.pos;
        let data = reader.take(data_length)?;

        if shape.elements() * ty.size_in_bytes() > data_length {
            return Err(Error::MalformedModel(format!(
                "entry {name}: {shape} does not fit in {data_length} bytes"
            )));
        }

        let tensor = match ty {
            ElementType::Ig8 if name == "Wemb_QuantMultA" => {
                // Placeholder entry; the useful multiplier for the output
                // projection ships as `none_QuantMultA`. Kept as an opaque
                // view so offsets stay intact.
                Tensor::from_view(shared.clone(), offset, data_length, ty, shape, name.as_str())
            }
            ElementType::Ig8 if name == "Wemb" => {
                let num_elements = shape.elements();
                if data_length < num_elements + 4 {
                    return Err(Error::MalformedModel(
                        "Wemb is missing its quantization multiplier".into(),
                    ));
                }
                let quantized =
                    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const i8, num_elements) };
                let multiplier =
                    LittleEndian::read_f32(&data[num_elements..num_elements + 4]);

                // Dequantize the shared embedding for input lookups.
                let mut weights = AlignedBuf::new(num_elements * 4);
                {
                    let out = unsafe {
                        std::slice::from_raw_parts_mut(
                            weights.as_mut_ptr() as *mut f32,
                            num_elements,
                        )
                    };
                    unquantize_embedding(quantized, multiplier, out);
                }

                let rows = shape.dim(-2);
                let cols = shape.dim(-1);
                if rows * cols % 8 != 0 {
                    return Err(Error::MalformedModel(
                        "embedding size is not a multiple of the kernel tile".into(),
                    ));
                }

                // Repack the same weights for the shortlisted output
                // projection, trailing multiplier included.
                let mut prepared = AlignedBuf::new(rows * cols + 4);
                {
                    let (body, tail) = prepared.split_at_mut(rows * cols);
                    let out = unsafe {
                        std::slice::from_raw_parts_mut(body.as_mut_ptr() as *mut i8, rows * cols)
                    };
                    let floats = unsafe {
                        std::slice::from_raw_parts(weights.as_ptr() as *const f32, num_elements)
                    };
                    qgemm::prepare_weight_transposed(floats, out, multiplier, cols, rows);
                    tail.copy_from_slice(&multiplier.to_le_bytes());
                }
                embedding_processed = Some((
                    "Wemb_intgemm8".to_string(),
                    Tensor::from_buffer(
                        prepared,
                        ElementType::Ig8,
                        Shape::new(vec![cols, rows]),
                        "Wemb_intgemm8",
                    ),
                ));

                Tensor::from_buffer(weights, ElementType::F32, shape, name.as_str())
            }
            ElementType::Ig8 => {
                let rows = shape.dim(-2);
                let cols = shape.dim(-1);
                let count = rows * cols;
                if data_length < count + 4 {
                    return Err(Error::MalformedModel(format!(
                        "entry {name} is missing its quantization multiplier"
                    )));
                }
                let input =
                    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const i8, count) };

                let mut repacked = AlignedBuf::new(count + 4);
                {
                    let (body, tail) = repacked.split_at_mut(count);
                    let out = unsafe {
                        std::slice::from_raw_parts_mut(body.as_mut_ptr() as *mut i8, count)
                    };
                    qgemm::prepare_weight_quantized_transposed(input, out, rows, cols);
                    tail.copy_from_slice(&data[count..count + 4]);
                }
                Tensor::from_buffer(repacked, ElementType::Ig8, shape, name.as_str())
            }
            _ => Tensor::from_view(shared.clone(), offset, data_length, ty, shape, name.as_str()),
        };

        items.push((name, tensor));
    }

    if let Some(entry) = embedding_processed {
        items.push(entry);
    }

    debug!(entries = items.len(), "loaded model container");
    Ok(items)
}

/// A tensor staged for [`write_items`].
pub struct WriteItem {
    pub name: String,
    pub ty: ElementType,
    pub shape: Shape,
    /// Raw little-endian bytes, trailing multiplier included for quantized
    /// weights.
    pub data: Vec<u8>,
}

fn type_code(ty: ElementType) -> u64 {
    match ty {
        ElementType::Ig8 => TYPE_INTGEMM8,
        ElementType::I8 => TYPE_INT8,
        ElementType::F32 => TYPE_FLOAT32,
        other => panic!("type {other:?} is not written to containers"),
    }
}

/// Serialize entries into the container layout [`load_items`] reads.
pub fn write_items(items: &[WriteItem]) -> Vec<u8> {
    let mut out = Vec::new();
    let push_u64 = |out: &mut Vec<u8>, v: u64| out.extend_from_slice(&v.to_le_bytes());

    push_u64(&mut out, BINARY_FILE_VERSION);
    push_u64(&mut out, items.len() as u64);

    for item in items {
        push_u64(&mut out, item.name.len() as u64 + 1);
        push_u64(&mut out, type_code(item.ty));
        push_u64(&mut out, item.shape.rank() as u64);
        push_u64(&mut out, item.data.len() as u64);
    }
    for item in items {
        out.extend_from_slice(item.name.as_bytes());
        out.push(0);
    }
    for item in items {
        for &dim in item.shape.dims() {
            out.extend_from_slice(&(dim as i32).to_le_bytes());
        }
    }

    // Alignment padding for the data section; the padding length word itself
    // precedes the pad bytes.
    let unaligned = out.len() + 8;
    let padding = (DATA_ALIGNMENT - unaligned % DATA_ALIGNMENT) % DATA_ALIGNMENT;
    push_u64(&mut out, padding as u64);
    out.resize(out.len() + padding, 0);

    for item in items {
        out.extend_from_slice(&item.data);
    }
    out
}
