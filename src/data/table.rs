use crate::error::{HsslError, Result};
use flate2::read::GzDecoder;
use ndarray::Array2;
use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tracing::info;

const SUPPORTED: [&str; 6] = ["csv", "csv.gz", "tsv", "tsv.gz", "txt(.gz)", "gz"];

/// Count matrix with named rows (segments) and columns (genes).
#[derive(Debug, Clone, PartialEq)]
pub struct CountTable {
    pub index: Vec<String>,
    pub genes: Vec<String>,
    /// (rows, genes)
    pub values: Array2<f32>,
}

impl CountTable {
    /// Column totals.
    pub fn totals(&self) -> Vec<f32> {
        self.values.sum_axis(ndarray::Axis(0)).to_vec()
    }

    /// Keep the columns at `columns`, in that order.
    pub fn select(&self, columns: &[usize]) -> Self {
        Self {
            index: self.index.clone(),
            genes: columns.iter().map(|&c| self.genes[c].clone()).collect(),
            values: self.values.select(ndarray::Axis(1), columns),
        }
    }
}

/// Gene filtering applied by [`read_data`].
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Drop genes whose name contains `ambiguous`. Ignored when `genes` is set.
    pub filter_ambiguous: bool,
    /// Keep the `n` genes with the highest total count, in ascending order.
    pub num_genes: Option<usize>,
    /// Reindex to exactly these genes, filling absent ones with zeros.
    pub genes: Option<Vec<String>>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            filter_ambiguous: true,
            num_genes: None,
            genes: None,
        }
    }
}

/// Field delimiter and gzip flag inferred from the file name.
fn format_for(path: &Path) -> Result<(u8, bool)> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let (stem, gzip) = match name.strip_suffix(".gz") {
        Some(stem) => (stem.to_string(), true),
        None => (name.clone(), false),
    };
    let delimiter = if stem.ends_with(".csv") {
        b','
    } else if stem.ends_with(".tsv") {
        b'\t'
    } else if stem.ends_with(".txt") || gzip {
        b' '
    } else {
        return Err(HsslError::UnsupportedFormat {
            path: path.display().to_string(),
            supported: SUPPORTED.to_vec(),
        });
    };
    Ok((delimiter, gzip))
}

fn parse_error(path: &Path, line: Option<u64>, message: String) -> HsslError {
    HsslError::Parse {
        path: path.display().to_string(),
        line: line.unwrap_or(0) as usize,
        message,
    }
}

fn csv_error(path: &Path, err: csv::Error) -> HsslError {
    let line = err.position().map(csv::Position::line);
    parse_error(path, line, err.to_string())
}

/// Read one delimited table. The first row names the columns and the first
/// column holds the row index.
pub fn read_table(path: impl AsRef<Path>) -> Result<CountTable> {
    let path = path.as_ref();
    let (delimiter, gzip) = format_for(path)?;
    info!("loading data file {}", path.display());

    let file = File::open(path).map_err(|err| HsslError::io(path, err))?;
    let reader: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(false)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let genes: Vec<String> = reader
        .headers()
        .map_err(|err| csv_error(path, err))?
        .iter()
        .skip(1)
        .map(str::to_string)
        .collect();

    let mut index = Vec::new();
    let mut values = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| csv_error(path, err))?;
        let line = record.position().map(csv::Position::line);
        let mut cells = record.iter();
        index.push(cells.next().unwrap_or_default().to_string());
        for cell in cells {
            let value = if cell.is_empty() {
                0.0
            } else {
                cell.parse::<f32>()
                    .map_err(|err| parse_error(path, line, format!("{cell:?}: {err}")))?
            };
            values.push(value);
        }
    }

    let values = Array2::from_shape_vec((index.len(), genes.len()), values).map_err(|_| {
        HsslError::DimensionMismatch {
            what: "table cells",
            expected: vec![index.len(), genes.len()],
            found: vec![],
        }
    })?;
    Ok(CountTable {
        index,
        genes,
        values,
    })
}

/// Read and merge count tables.
///
/// Rows are concatenated in file order and gene columns are unioned in
/// first-seen order, with missing entries filled with zero. Genes with no
/// counts are dropped, then `options` are applied.
pub fn read_data<P: AsRef<Path>>(paths: &[P], options: &ReadOptions) -> Result<CountTable> {
    let tables = paths
        .iter()
        .map(|path| read_table(path))
        .collect::<Result<Vec<_>>>()?;

    let mut genes: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    for table in &tables {
        for gene in &table.genes {
            if !positions.contains_key(gene) {
                positions.insert(gene.clone(), genes.len());
                genes.push(gene.clone());
            }
        }
    }

    let num_rows = tables.iter().map(|t| t.index.len()).sum();
    let mut values = Array2::zeros((num_rows, genes.len()));
    let mut index = Vec::with_capacity(num_rows);
    for table in &tables {
        let offset = index.len();
        for (col, gene) in table.genes.iter().enumerate() {
            let target = positions[gene];
            for row in 0..table.index.len() {
                values[[offset + row, target]] += table.values[[row, col]];
            }
        }
        index.extend(table.index.iter().cloned());
    }
    let mut data = CountTable {
        index,
        genes,
        values,
    };

    let nonzero: Vec<usize> = data
        .totals()
        .iter()
        .enumerate()
        .filter(|(_, total)| **total > 0.0)
        .map(|(col, _)| col)
        .collect();
    data = data.select(&nonzero);

    if let Some(allowed) = &options.genes {
        let positions: HashMap<&str, usize> = data
            .genes
            .iter()
            .enumerate()
            .map(|(col, gene)| (gene.as_str(), col))
            .collect();
        let mut values = Array2::zeros((data.index.len(), allowed.len()));
        for (col, gene) in allowed.iter().enumerate() {
            if let Some(&source) = positions.get(gene.as_str()) {
                values.column_mut(col).assign(&data.values.column(source));
            }
        }
        data = CountTable {
            index: data.index,
            genes: allowed.clone(),
            values,
        };
    } else if options.filter_ambiguous {
        let keep: Vec<usize> = data
            .genes
            .iter()
            .enumerate()
            .filter(|(_, gene)| !gene.contains("ambiguous"))
            .map(|(col, _)| col)
            .collect();
        data = data.select(&keep);
    }

    if let Some(n) = options.num_genes.filter(|n| *n > 0) {
        let totals = data.totals();
        let mut order: Vec<usize> = (0..data.genes.len()).collect();
        order.sort_by(|a, b| totals[*a].total_cmp(&totals[*b]));
        let start = order.len().saturating_sub(n);
        data = data.select(&order[start..]);
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::tempdir;

    fn write(path: &Path, contents: &str) {
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn reads_gzip_whitespace_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(b"n A B\n1 1 0\n2 3 4\n").unwrap();
        encoder.finish().unwrap();

        let table = read_table(&path).unwrap();
        assert_eq!(table.index, vec!["1", "2"]);
        assert_eq!(table.genes, vec!["A", "B"]);
        assert_eq!(table.values.row(1).to_vec(), vec![3.0, 4.0]);
    }

    #[test]
    fn unions_genes_and_fills_zero() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.csv");
        let second = dir.path().join("b.tsv");
        write(&first, "n,A,B\n1,1,2\n");
        write(&second, "n\tC\tA\n1\t5\t7\n");

        let table = read_data(&[first, second], &ReadOptions::default()).unwrap();
        assert_eq!(table.genes, vec!["A", "B", "C"]);
        assert_eq!(table.values.row(0).to_vec(), vec![1.0, 2.0, 0.0]);
        assert_eq!(table.values.row(1).to_vec(), vec![7.0, 0.0, 5.0]);
    }

    #[test]
    fn drops_zero_and_ambiguous_genes_and_keeps_top() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        write(
            &path,
            "n,A,B,ambiguous_C,D,E\n1,5,0,9,1,2\n2,5,0,9,1,2\n",
        );

        let options = ReadOptions {
            num_genes: Some(2),
            ..ReadOptions::default()
        };
        let table = read_data(&[&path], &options).unwrap();
        assert_eq!(table.genes, vec!["E", "A"]);

        let unfiltered = ReadOptions {
            filter_ambiguous: false,
            ..ReadOptions::default()
        };
        let table = read_data(&[&path], &unfiltered).unwrap();
        assert_eq!(table.genes, vec!["A", "ambiguous_C", "D", "E"]);
    }

    #[test]
    fn allowlist_reindexes_genes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.txt");
        write(&path, "n A B\n1 1 2\n");

        let options = ReadOptions {
            genes: Some(vec!["B".into(), "Z".into()]),
            ..ReadOptions::default()
        };
        let table = read_data(&[&path], &options).unwrap();
        assert_eq!(table.genes, vec!["B", "Z"]);
        assert_eq!(table.values.row(0).to_vec(), vec![2.0, 0.0]);
    }

    #[test]
    fn unknown_extension_lists_supported_patterns() {
        let err = read_table("counts.h5").unwrap_err();
        match &err {
            HsslError::UnsupportedFormat { supported, .. } => assert!(supported.contains(&"csv")),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("tsv.gz"));
    }

    #[test]
    fn quoted_fields_are_unquoted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        write(&path, "\"n\",\"A\",\"B, C\"\n\"1\",\"5\",\"2\"\n");

        let table = read_table(&path).unwrap();
        assert_eq!(table.index, vec!["1"]);
        assert_eq!(table.genes, vec!["A", "B, C"]);
        assert_eq!(table.values.row(0).to_vec(), vec![5.0, 2.0]);
    }

    #[test]
    fn ragged_row_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        write(&path, "n,A,B\n1,2,3\n2,4\n");
        assert!(matches!(read_table(&path), Err(HsslError::Parse { line: 3, .. })));
    }

    #[test]
    fn malformed_cell_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.csv");
        write(&path, "n,A\n1,x\n");
        assert!(matches!(read_table(&path), Err(HsslError::Parse { line: 2, .. })));
    }
}
