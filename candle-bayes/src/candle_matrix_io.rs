use candle_core::{Device, Tensor};
use flate2::read::GzDecoder;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

///
/// Read a delimited text matrix (gzipped or not) into a 2d `Tensor`
/// on the CPU device. Lines starting with `#` or `%` are comments.
///
/// * `input_file` - file name; ".gz" triggers decompression
/// * `delims` - any of these characters separates fields
/// * `skip` - number of leading lines to skip (header etc.)
///
pub fn read_matrix(input_file: &str, delims: &[char], skip: Option<usize>) -> anyhow::Result<Tensor> {
    let buf: Box<dyn BufRead> = open_buf_reader(input_file)?;
    let skip = skip.unwrap_or(0);

    let lines: Vec<Box<str>> = buf
        .lines()
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .skip(skip)
        .filter(|line| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#') && !line.starts_with('%')
        })
        .map(|line| line.into_boxed_str())
        .collect();

    if lines.is_empty() {
        return Err(anyhow::anyhow!("no data lines in {}", input_file));
    }

    let mut rows = lines
        .par_iter()
        .enumerate()
        .map(|(i, line)| -> anyhow::Result<(usize, Vec<f32>)> {
            let row = line
                .split(delims)
                .filter(|x| !x.is_empty())
                .map(|x| x.parse::<f32>())
                .collect::<Result<Vec<f32>, _>>()?;
            Ok((i, row))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    rows.sort_by_key(|(i, _)| *i);

    let ncol = rows[0].1.len();
    if let Some((i, row)) = rows.iter().find(|(_, row)| row.len() != ncol) {
        return Err(anyhow::anyhow!(
            "ragged matrix: line {} has {} fields, expected {}",
            i + skip + 1,
            row.len(),
            ncol
        ));
    }

    let nrow = rows.len();
    let data: Vec<f32> = rows.into_iter().flat_map(|(_, row)| row).collect();
    Ok(Tensor::from_vec(data, (nrow, ncol), &Device::Cpu)?)
}

///
/// Write a 2d `Tensor` to a delimited text file (gzipped or not)
///
/// * `data` - 2d tensor
/// * `output_file` - file name; ".gz" triggers compression
/// * `delim` - field separator
///
pub fn write_matrix(data: &Tensor, output_file: &str, delim: &str) -> anyhow::Result<()> {
    let dims = data.dims();
    if dims.len() != 2 {
        return Err(anyhow::anyhow!("expected 2 dimensions, found {}", dims.len()));
    }

    let mut lines = Vec::with_capacity(dims[0]);
    for r in 0..dims[0] {
        let row = data.narrow(0, r, 1)?.flatten_all()?.to_vec1::<f32>()?;
        let line = row
            .iter()
            .map(|x| format!("{}", x))
            .collect::<Vec<_>>()
            .join(delim);
        lines.push(line.into_boxed_str());
    }
    write_lines(&lines, output_file)
}

///
/// Write every line into the output_file
///
/// * `lines` - vector of lines
/// * `output_file` - file name--either gzipped or not
///
pub fn write_lines(lines: &[Box<str>], output_file: &str) -> anyhow::Result<()> {
    let mut buf = open_buf_writer(output_file)?;
    for line in lines {
        if let Err(e) = writeln!(buf, "{}", line) {
            if e.kind() == std::io::ErrorKind::BrokenPipe {
                return Ok(());
            } else {
                return Err(anyhow::anyhow!("unexpected error: {}", e));
            }
        }
    }
    buf.flush()?;
    Ok(())
}

pub fn open_buf_reader(input_file: &str) -> anyhow::Result<Box<dyn BufRead>> {
    // branch on the extension
    let ext = Path::new(input_file).extension().and_then(|x| x.to_str());
    match ext {
        Some("gz") => {
            let input_file = File::open(input_file)?;
            let decoder = GzDecoder::new(input_file);
            Ok(Box::new(BufReader::new(decoder)))
        }
        _ => {
            let input_file = File::open(input_file)?;
            Ok(Box::new(BufReader::new(input_file)))
        }
    }
}

pub fn open_buf_writer(output_file: &str) -> anyhow::Result<Box<dyn std::io::Write>> {
    // we can simply override with stdout
    if output_file.eq_ignore_ascii_case("stdout") {
        return Ok(Box::new(std::io::BufWriter::new(std::io::stdout())));
    }

    let ext = Path::new(output_file).extension().and_then(|x| x.to_str());
    match ext {
        Some("gz") => {
            let output_file = File::create(output_file)?;
            let encoder =
                flate2::write::GzEncoder::new(output_file, flate2::Compression::default());
            Ok(Box::new(BufWriter::new(encoder)))
        }
        _ => {
            let output_file = File::create(output_file)?;
            Ok(Box::new(BufWriter::new(output_file)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn matrix_round_trip_plain_and_gz() -> anyhow::Result<()> {
        let dir = tempdir()?;

        let data = Tensor::rand(0f32, 1f32, (5, 7), &Device::Cpu)?;
        for name in ["mat.tsv", "mat.tsv.gz"] {
            let path = dir.path().join(name);
            let path = path.to_str().expect("utf-8 path");

            write_matrix(&data, path, "\t")?;
            let back = read_matrix(path, &['\t'], None)?;

            assert_eq!(back.dims(), data.dims());
            let gap = (&back - &data)?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(gap < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn comments_and_headers_are_skipped() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("annotated.csv");
        let path = path.to_str().expect("utf-8 path");

        let lines: Vec<Box<str>> = vec![
            "col1,col2".into(),
            "# a comment".into(),
            "1.5,2.5".into(),
            "3.5,4.5".into(),
        ];
        write_lines(&lines, path)?;

        let mat = read_matrix(path, &[','], Some(1))?;
        assert_eq!(mat.dims(), &[2, 2]);
        assert_eq!(
            mat.to_vec2::<f32>()?,
            vec![vec![1.5f32, 2.5], vec![3.5f32, 4.5]]
        );
        Ok(())
    }

    #[test]
    fn ragged_and_malformed_input_fails() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("bad.tsv");
        let path = path.to_str().expect("utf-8 path");

        write_lines(&["1\t2".into(), "3".into()], path)?;
        assert!(read_matrix(path, &['\t'], None).is_err());

        write_lines(&["1\tx".into()], path)?;
        assert!(read_matrix(path, &['\t'], None).is_err());
        Ok(())
    }
}
