use candle_core::{Device, Tensor};
use nalgebra::DMatrix;
use ndarray::Array2;
use rayon::prelude::*;

/// One minibatch, already on the requested device. `output` is only
/// present when the loader carries a separate target channel.
pub struct MinibatchData {
    pub input: Tensor,
    pub output: Option<Tensor>,
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A simple data loader for in-memory 2d matrices. Each row is one
/// sample; the number of rows is the number of samples.
///
pub struct InMemoryData {
    input_data: Vec<Tensor>,
    output_data: Option<Vec<Tensor>>,

    shuffled_input_data: Option<Vec<Tensor>>,
    shuffled_output_data: Option<Vec<Tensor>>,

    minibatches: Minibatches,
}

impl InMemoryData {
    ///
    /// Create a data loader with the main data tensor `data`
    ///
    pub fn new<D>(data: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let data = data.rows_to_tensor_vec();
        if data.is_empty() {
            return Err(anyhow::anyhow!("empty data"));
        }
        let num_samples = data.len();

        Ok(InMemoryData {
            input_data: data,
            output_data: None,
            shuffled_input_data: None,
            shuffled_output_data: None,
            minibatches: Minibatches {
                num_samples,
                chunks: vec![],
            },
        })
    }

    ///
    /// Create a data loader with the main `data` and target `out`,
    /// paired row by row
    ///
    pub fn new_with_output<D>(data: &D, out: &D) -> anyhow::Result<Self>
    where
        D: RowsToTensorVec,
    {
        let data = data.rows_to_tensor_vec();
        let out_data = out.rows_to_tensor_vec();
        if data.is_empty() {
            return Err(anyhow::anyhow!("empty data"));
        }
        if data.len() != out_data.len() {
            return Err(anyhow::anyhow!(
                "input has {} rows but output has {}",
                data.len(),
                out_data.len()
            ));
        }
        let num_samples = data.len();

        Ok(InMemoryData {
            input_data: data,
            output_data: Some(out_data),
            shuffled_input_data: None,
            shuffled_output_data: None,
            minibatches: Minibatches {
                num_samples,
                chunks: vec![],
            },
        })
    }

    pub fn num_samples(&self) -> usize {
        self.minibatches.num_samples
    }
}

impl DataLoader for InMemoryData {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        if let Some(input) =
            take_shuffled(batch_idx, target_device, self.shuffled_input_data.as_ref())?
        {
            let output =
                take_shuffled(batch_idx, target_device, self.shuffled_output_data.as_ref())?;
            Ok(MinibatchData { input, output })
        } else {
            Err(anyhow::anyhow!("need to shuffle data"))
        }
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        if batch_size < 1 {
            return Err(anyhow::anyhow!("batch size must be positive"));
        }

        self.minibatches.shuffle_minibatch(batch_size);

        // preload all the shuffled data
        self.shuffled_input_data = Some(preload_chunks(&self.minibatches.chunks, &self.input_data)?);

        self.shuffled_output_data = match self.output_data.as_ref() {
            Some(out_data) => Some(preload_chunks(&self.minibatches.chunks, out_data)?),
            None => None,
        };

        Ok(())
    }
}

fn preload_chunks(chunks: &[Vec<usize>], rows: &[Tensor]) -> anyhow::Result<Vec<Tensor>> {
    chunks
        .iter()
        .map(|samples| {
            let chunk: Vec<Tensor> = samples.iter().map(|&i| rows[i].clone()).collect();
            Ok(Tensor::cat(&chunk, 0)?)
        })
        .collect()
}

fn take_shuffled(
    batch_idx: usize,
    target_device: &Device,
    data_vec: Option<&Vec<Tensor>>,
) -> anyhow::Result<Option<Tensor>> {
    if let Some(data_vec) = data_vec {
        if data_vec.len() <= batch_idx {
            Err(anyhow::anyhow!(
                "invalid index = {} vs. total # = {}",
                batch_idx,
                data_vec.len()
            ))
        } else {
            Ok(Some(data_vec[batch_idx].to_device(target_device)?))
        }
    } else {
        // if the data vector doesn't exist
        Ok(None)
    }
}

///
/// A helper `struct` for creating minibatch indexes; after
/// `shuffle_minibatch` is called, `chunks` hold bootstrapped indexes,
/// `batch_size` each.
///
pub struct Minibatches {
    num_samples: usize,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize) {
        use rand_distr::{Distribution, Uniform};

        let nbatch = (self.size() + batch_size) / batch_size;
        let ntot = nbatch * batch_size;

        let unif = Uniform::new(0, self.size()).expect("unif [0 .. size)");

        let indexes = (0..ntot)
            .into_par_iter()
            .map_init(rand::rng, |rng, _| unif.sample(rng))
            .collect::<Vec<usize>>();

        self.chunks = (0..nbatch)
            .par_bridge()
            .map(|b| {
                let lb = b * batch_size;
                let ub = (b + 1) * batch_size;
                (lb..ub).map(|i| indexes[i]).collect()
            })
            .collect::<Vec<Vec<usize>>>();
    }

    pub fn size(&self) -> usize {
        self.num_samples
    }
}

///
/// Convert rows of a matrix to a vector of `Tensor`
///
pub trait RowsToTensorVec {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor>;
}

impl RowsToTensorVec for Array2<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let mut idx_data = self
            .axis_iter(ndarray::Axis(0))
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                let mut v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)
                    .expect("failed to create tensor");
                v = v.reshape((1, row.len())).expect("failed to reshape");
                (i, v)
            })
            .collect::<Vec<_>>();

        idx_data.sort_by_key(|(i, _)| *i);
        idx_data.into_iter().map(|(_, t)| t).collect()
    }
}

impl RowsToTensorVec for DMatrix<f32> {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        let mut idx_data = self
            .row_iter()
            .enumerate()
            .par_bridge()
            .map(|(i, row)| {
                let mut v = Tensor::from_iter(row.iter().copied(), &Device::Cpu)
                    .expect("failed to create tensor");
                v = v.reshape((1, row.len())).expect("failed to reshape");
                (i, v)
            })
            .collect::<Vec<_>>();

        idx_data.sort_by_key(|(i, _)| *i);
        idx_data.into_iter().map(|(_, t)| t).collect()
    }
}

impl RowsToTensorVec for Tensor {
    fn rows_to_tensor_vec(&self) -> Vec<Tensor> {
        (0..self.dims()[0])
            .map(|i| self.narrow(0, i, 1).expect("failed to slice row"))
            .collect()
    }
}
