//! Info command - prints the header of an image

use anyhow::{Context, Result};
use console::style;
use partimg_core::{projected_image_size, read_header, ImageHeader};

use crate::device::open_image_reader;
use crate::progress::format_size;

/// Execute the info command
pub fn execute(image_path: &str, json: bool) -> Result<()> {
    let mut image = open_image_reader(image_path)?;
    let header = read_header(&mut *image)
        .with_context(|| format!("Failed to read image header from {}", image_path))?;

    if json {
        let output = serde_json::to_string_pretty(&header_json(&header))
            .context("Failed to serialize header to JSON")?;
        println!("{}", output);
    } else {
        print_header(image_path, &header);
    }

    Ok(())
}

fn header_json(header: &ImageHeader) -> serde_json::Value {
    serde_json::json!({
        "header": header,
        "partition_size": header.partition_size(),
        "used_size": header.used_size(),
        "image_size": projected_image_size(header),
    })
}

fn print_header(image_path: &str, header: &ImageHeader) {
    println!("{} {}", style("Image:").bold(), style(image_path).cyan());
    println!();
    println!("  {:<14} {}", "File system:", header.fs_type);
    println!("  {:<14} {}", "Version:", header.version);
    println!(
        "  {:<14} {} ({} bytes)",
        "Device size:",
        format_size(header.device_size),
        header.device_size
    );
    println!(
        "  {:<14} {} = {} blocks",
        "Space in use:",
        format_size(header.used_size()),
        header.used_blocks
    );
    println!(
        "  {:<14} {} = {} blocks",
        "Free space:",
        format_size(header.partition_size() - header.used_size()),
        header.total_blocks - header.used_blocks
    );
    println!("  {:<14} {} bytes", "Block size:", header.block_size);
    println!(
        "  {:<14} {}",
        "Image size:",
        format_size(projected_image_size(header))
    );
}
