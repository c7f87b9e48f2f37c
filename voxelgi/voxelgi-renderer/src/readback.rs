//! Blocking GPU -> CPU copies for tests and debug tools. Each call submits its own copy and
//! waits on the device, so never use these inside a frame.

use half::f16;

fn map_read(device: &wgpu::Device, staging: &wgpu::Buffer) -> Result<(), String> {
    let slice = staging.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |res| {
        let _ = tx.send(res);
    });
    device.poll(wgpu::Maintain::Wait);
    rx.recv()
        .map_err(|_| "readback: map_async channel closed".to_string())?
        .map_err(|e| format!("readback: map_async failed: {:?}", e))
}

fn staging_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("voxelgi_readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Copy the first `size` bytes of `src` (which needs COPY_SRC) into host memory.
pub fn read_buffer(device: &wgpu::Device, queue: &wgpu::Queue, src: &wgpu::Buffer, size: u64) -> Result<Vec<u8>, String> {
    if size > src.size() {
        return Err(format!("readback: {} bytes requested from a {} byte buffer", size, src.size()));
    }
    let staging = staging_buffer(device, size);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("voxelgi_readback") });
    encoder.copy_buffer_to_buffer(src, 0, &staging, 0, size);
    queue.submit([encoder.finish()]);
    map_read(device, &staging)?;
    let data = staging.slice(..).get_mapped_range().to_vec();
    staging.unmap();
    Ok(data)
}

/// `read_buffer` reinterpreted as `T` elements.
pub fn read_pod<T: bytemuck::Pod>(device: &wgpu::Device, queue: &wgpu::Queue, src: &wgpu::Buffer) -> Result<Vec<T>, String> {
    let bytes = read_buffer(device, queue, src, src.size())?;
    let n = bytes.len() / std::mem::size_of::<T>();
    let mut out = vec![T::zeroed(); n];
    bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&bytes[..n * std::mem::size_of::<T>()]);
    Ok(out)
}

/// Read one mip level of an Rgba16Float 3D texture as linear RGBA floats, x fastest.
pub fn read_volume_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
    mip: u32,
) -> Result<Vec<[f32; 4]>, String> {
    if texture.format() != wgpu::TextureFormat::Rgba16Float {
        return Err(format!("readback: unsupported texture format {:?}", texture.format()));
    }
    if mip >= texture.mip_level_count() {
        return Err(format!("readback: mip {} out of range", mip));
    }
    let edge = (texture.width() >> mip).max(1);
    let row_bytes = edge * 8;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    let padded = row_bytes.div_ceil(align) * align;
    let staging = staging_buffer(device, padded as u64 * edge as u64 * edge as u64);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("voxelgi_readback") });
    encoder.copy_texture_to_buffer(
        wgpu::ImageCopyTexture { texture, mip_level: mip, origin: wgpu::Origin3d::ZERO, aspect: wgpu::TextureAspect::All },
        wgpu::ImageCopyBuffer {
            buffer: &staging,
            layout: wgpu::ImageDataLayout { offset: 0, bytes_per_row: Some(padded), rows_per_image: Some(edge) },
        },
        wgpu::Extent3d { width: edge, height: edge, depth_or_array_layers: edge },
    );
    queue.submit([encoder.finish()]);
    map_read(device, &staging)?;

    let mut out = Vec::with_capacity((edge * edge * edge) as usize);
    {
        let data = staging.slice(..).get_mapped_range();
        for row in data.chunks_exact(padded as usize) {
            for texel in row[..row_bytes as usize].chunks_exact(8) {
                let c = |o: usize| f16::from_bits(u16::from_le_bytes([texel[o], texel[o + 1]])).to_f32();
                out.push([c(0), c(2), c(4), c(6)]);
            }
        }
    }
    staging.unmap();
    Ok(out)
}
