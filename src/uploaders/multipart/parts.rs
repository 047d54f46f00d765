use crate::core::{PartRange, PartResult, Result, UploadError};

/// 分片数量：`ceil(file_size / chunk_size)`
pub fn part_count(file_size: u64, chunk_size: u64) -> Result<u32> {
    if chunk_size == 0 {
        return Err(UploadError::invalid_argument("Chunk size must be greater than 0"));
    }

    u32::try_from(file_size.div_ceil(chunk_size)).map_err(|_| {
        UploadError::invalid_argument(format!(
            "File of {} bytes needs too many parts with chunk size {}",
            file_size, chunk_size
        ))
    })
}

/// 计算分片信息
///
/// 把 `[0, file_size)` 切成连续、不重叠的区间，最后一片取余数。分片号从 1 开始且连续，
/// 这是对象存储合并分片时要求的顺序。
pub fn compute_parts(file_size: u64, chunk_size: u64) -> Result<Vec<PartRange>> {
    let total = part_count(file_size, chunk_size)?;
    let mut parts = Vec::with_capacity(total as usize);
    let mut offset = 0;
    let mut part_number = 1;

    while offset < file_size {
        let end = std::cmp::min(offset.saturating_add(chunk_size), file_size);
        parts.push(PartRange {
            part_number,
            start: offset,
            end,
        });
        offset = end;
        part_number += 1;
    }

    Ok(parts)
}

/// 按分片号排序并检查 `1..=total_parts` 每个分片恰好出现一次
pub fn ordered_parts(mut parts: Vec<PartResult>, total_parts: u32) -> Result<Vec<PartResult>> {
    parts.sort_by_key(|part| part.part_number);

    if parts.len() as u64 != total_parts as u64 {
        return Err(UploadError::IncompleteParts {
            expected: total_parts,
            actual: parts.len() as u32,
        });
    }

    for (index, part) in parts.iter().enumerate() {
        if part.part_number != index as u32 + 1 {
            return Err(UploadError::invalid_argument(format!(
                "Parts must be numbered 1..={} without gaps or duplicates, found {} at position {}",
                total_parts,
                part.part_number,
                index + 1
            )));
        }
    }

    Ok(parts)
}
