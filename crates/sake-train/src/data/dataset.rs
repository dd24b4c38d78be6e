//! Length-grouped molecular dataset.
//!
//! Molecules are stored in groups that share an atom count so that every
//! batch is a dense tensor without padding.

use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{data_error, IoResultExt, TrainResult};

/// All records with the same number of atoms.
#[derive(Debug, Clone)]
pub struct LengthGroup {
    /// Element indices, `[n, n_atoms]`, i64.
    pub species: Tensor,
    /// Cartesian coordinates, `[n, n_atoms, 3]`, f32.
    pub coords: Tensor,
    /// Regression targets, `[n]`, f32.
    pub targets: Tensor,
}

impl LengthGroup {
    /// Build a group, normalising dtypes and flattening targets.
    pub fn new(species: Tensor, coords: Tensor, targets: Tensor) -> TrainResult<Self> {
        let species = species.to_device(&Device::Cpu)?.to_dtype(DType::I64)?;
        let coords = coords.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        let targets = targets
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?;

        let (n, n_atoms) = species
            .dims2()
            .map_err(|_| data_error(format!("species must be [n, atoms], got {:?}", species.dims())))?;
        match coords.dims() {
            &[cn, ca, 3] if cn == n && ca == n_atoms => {}
            other => {
                return Err(data_error(format!(
                    "coords must be [{}, {}, 3], got {:?}",
                    n, n_atoms, other
                )))
            }
        }
        if targets.elem_count() != n {
            return Err(data_error(format!(
                "expected {} targets, got {}",
                n,
                targets.elem_count()
            )));
        }

        Ok(Self {
            species,
            coords,
            targets,
        })
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.species.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atoms per record.
    pub fn n_atoms(&self) -> usize {
        self.species.dims()[1]
    }
}

/// Dataset keyed by atom count, iterated in ascending order.
#[derive(Debug, Clone, Default)]
pub struct MoleculeDataset {
    groups: BTreeMap<usize, LengthGroup>,
}

impl MoleculeDataset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a group. Each atom count may appear only once.
    pub fn insert(&mut self, group: LengthGroup) -> TrainResult<()> {
        let n_atoms = group.n_atoms();
        if self.groups.contains_key(&n_atoms) {
            return Err(data_error(format!("duplicate group for length {}", n_atoms)));
        }
        self.groups.insert(n_atoms, group);
        Ok(())
    }

    pub fn from_groups(groups: impl IntoIterator<Item = LengthGroup>) -> TrainResult<Self> {
        let mut ds = Self::new();
        for group in groups {
            ds.insert(group)?;
        }
        Ok(ds)
    }

    pub fn group(&self, n_atoms: usize) -> Option<&LengthGroup> {
        self.groups.get(&n_atoms)
    }

    pub fn groups(&self) -> impl Iterator<Item = (usize, &LengthGroup)> {
        self.groups.iter().map(|(k, g)| (*k, g))
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    /// Total number of records across groups.
    pub fn len(&self) -> usize {
        self.groups.values().map(LengthGroup::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mean and population standard deviation of every target.
    pub fn statistics(&self) -> TrainResult<(f64, f64)> {
        let mut ys: Vec<f64> = Vec::with_capacity(self.len());
        for group in self.groups.values() {
            ys.extend(group.targets.to_vec1::<f32>()?.into_iter().map(f64::from));
        }
        if ys.is_empty() {
            return Err(data_error("cannot compute statistics of an empty dataset"));
        }
        let n = ys.len() as f64;
        let mean = ys.iter().sum::<f64>() / n;
        let var = ys.iter().map(|y| (y - mean).powi(2)).sum::<f64>() / n;
        Ok((mean, var.sqrt()))
    }

    /// Load from an `.npz` archive with `i_<L>`, `x_<L>`, `y_<L>` per length.
    pub fn load_npz(path: &Path) -> TrainResult<Self> {
        std::fs::metadata(path).with_path(path)?;
        let arrays = Tensor::read_npz(path)
            .map_err(|e| data_error(format!("{}: {}", path.display(), e)))?;

        type Triple = (Option<Tensor>, Option<Tensor>, Option<Tensor>);
        let mut pending: BTreeMap<usize, Triple> = BTreeMap::new();
        for (name, tensor) in arrays {
            let (kind, length) = name
                .split_once('_')
                .ok_or_else(|| data_error(format!("unexpected array '{}'", name)))?;
            let length: usize = length
                .parse()
                .map_err(|_| data_error(format!("unparsable length in array '{}'", name)))?;
            let slot = pending.entry(length).or_default();
            match kind {
                "i" => slot.0 = Some(tensor),
                "x" => slot.1 = Some(tensor),
                "y" => slot.2 = Some(tensor),
                _ => return Err(data_error(format!("unexpected array '{}'", name))),
            }
        }

        let mut ds = Self::new();
        for (length, triple) in pending {
            let (Some(i), Some(x), Some(y)) = triple else {
                return Err(data_error(format!(
                    "length {} is missing one of i_{0}, x_{0}, y_{0}",
                    length
                )));
            };
            let group = LengthGroup::new(i, x, y)?;
            if group.n_atoms() != length {
                return Err(data_error(format!(
                    "array i_{} holds molecules with {} atoms",
                    length,
                    group.n_atoms()
                )));
            }
            ds.insert(group)?;
        }
        Ok(ds)
    }

    /// Write the layout read by [`load_npz`](Self::load_npz).
    pub fn save_npz(&self, path: &Path) -> TrainResult<()> {
        let mut entries: Vec<(String, &Tensor)> = Vec::with_capacity(3 * self.groups.len());
        for (length, group) in &self.groups {
            entries.push((format!("i_{}", length), &group.species));
            entries.push((format!("x_{}", length), &group.coords));
            entries.push((format!("y_{}", length), &group.targets));
        }
        Tensor::write_npz(&entries, path)
            .map_err(|e| data_error(format!("{}: {}", path.display(), e)))
    }

    /// Random molecules with a smooth, learnable target.
    ///
    /// The target is a per-species offset plus a sum of `exp(-d_ij)` over atom
    /// pairs, so it depends on both composition and geometry.
    pub fn synthetic(lengths: &[usize], records_per_length: usize, seed: u64) -> TrainResult<Self> {
        const OFFSETS: [f32; 4] = [-0.5, -38.0, -54.6, -75.0];
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut ds = Self::new();

        for &n_atoms in lengths {
            if n_atoms == 0 {
                return Err(data_error("synthetic molecules need at least one atom"));
            }
            let n = records_per_length;
            let mut species = Vec::with_capacity(n * n_atoms);
            let mut coords = Vec::with_capacity(n * n_atoms * 3);
            let mut targets = Vec::with_capacity(n);

            for _ in 0..n {
                let start = coords.len();
                let mut energy = 0.0f32;
                for _ in 0..n_atoms {
                    let s = rng.gen_range(0..OFFSETS.len());
                    species.push(s as i64);
                    energy += OFFSETS[s];
                    for _ in 0..3 {
                        coords.push(rng.gen_range(-1.5f32..1.5));
                    }
                }
                let mol = &coords[start..];
                for a in 0..n_atoms {
                    for b in (a + 1)..n_atoms {
                        let d2: f32 = (0..3)
                            .map(|k| (mol[3 * a + k] - mol[3 * b + k]).powi(2))
                            .sum();
                        energy += (-d2.sqrt()).exp();
                    }
                }
                targets.push(energy);
            }

            let device = Device::Cpu;
            ds.insert(LengthGroup::new(
                Tensor::from_vec(species, (n, n_atoms), &device)?,
                Tensor::from_vec(coords, (n, n_atoms, 3), &device)?,
                Tensor::from_vec(targets, n, &device)?,
            )?)?;
        }
        Ok(ds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_dataset_shapes() -> TrainResult<()> {
        let ds = MoleculeDataset::synthetic(&[3, 5], 10, 42)?;
        assert_eq!(ds.n_groups(), 2);
        assert_eq!(ds.len(), 20);

        let g = ds.group(5).expect("group of 5 atoms");
        assert_eq!(g.len(), 10);
        assert_eq!(g.n_atoms(), 5);
        assert_eq!(g.coords.dims(), &[10, 5, 3]);
        assert_eq!(g.targets.dims(), &[10]);
        assert_eq!(g.species.dtype(), DType::I64);
        Ok(())
    }

    #[test]
    fn test_groups_iterate_in_ascending_length() -> TrainResult<()> {
        let ds = MoleculeDataset::synthetic(&[7, 2, 4], 3, 1)?;
        let lengths: Vec<usize> = ds.groups().map(|(l, _)| l).collect();
        assert_eq!(lengths, vec![2, 4, 7]);
        Ok(())
    }

    #[test]
    fn test_statistics_population_std() -> TrainResult<()> {
        let device = Device::Cpu;
        let group = LengthGroup::new(
            Tensor::zeros((4, 1), DType::I64, &device)?,
            Tensor::zeros((4, 1, 3), DType::F32, &device)?,
            Tensor::new(&[[1.0f32], [2.0], [3.0], [4.0]], &device)?,
        )?;
        let ds = MoleculeDataset::from_groups([group])?;
        let (mean, std) = ds.statistics()?;
        assert!((mean - 2.5).abs() < 1e-9);
        // population std of 1..4 is sqrt(1.25)
        assert!((std - 1.25f64.sqrt()).abs() < 1e-6, "std={}", std);
        Ok(())
    }

    #[test]
    fn test_statistics_of_empty_dataset_fails() {
        assert!(MoleculeDataset::new().statistics().is_err());
    }

    #[test]
    fn test_group_shape_validation() -> TrainResult<()> {
        let device = Device::Cpu;
        let bad = LengthGroup::new(
            Tensor::zeros((4, 3), DType::I64, &device)?,
            Tensor::zeros((4, 2, 3), DType::F32, &device)?,
            Tensor::zeros(4, DType::F32, &device)?,
        );
        assert!(bad.is_err());

        let bad_targets = LengthGroup::new(
            Tensor::zeros((4, 3), DType::I64, &device)?,
            Tensor::zeros((4, 3, 3), DType::F32, &device)?,
            Tensor::zeros(5, DType::F32, &device)?,
        );
        assert!(bad_targets.is_err());
        Ok(())
    }

    #[test]
    fn test_duplicate_length_rejected() -> TrainResult<()> {
        let ds = MoleculeDataset::synthetic(&[3], 2, 0)?;
        let group = ds.group(3).cloned().expect("group");
        let mut ds = ds;
        assert!(ds.insert(group).is_err());
        Ok(())
    }

    #[test]
    fn test_npz_save_load() -> TrainResult<()> {
        let ds = MoleculeDataset::synthetic(&[2, 6], 5, 9)?;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ds_tr.npz");
        ds.save_npz(&path)?;

        let loaded = MoleculeDataset::load_npz(&path)?;
        assert_eq!(loaded.n_groups(), 2);
        assert_eq!(loaded.len(), 10);
        let a = ds.group(6).unwrap().targets.to_vec1::<f32>()?;
        let b = loaded.group(6).unwrap().targets.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_npz_missing_member_rejected() -> TrainResult<()> {
        let device = Device::Cpu;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.npz");
        let species = Tensor::zeros((2, 3), DType::I64, &device)?;
        let coords = Tensor::zeros((2, 3, 3), DType::F32, &device)?;
        Tensor::write_npz(&[("i_3", &species), ("x_3", &coords)], &path)?;

        let err = MoleculeDataset::load_npz(&path).unwrap_err();
        assert!(err.to_string().contains("missing"), "{}", err);
        Ok(())
    }

    #[test]
    fn test_npz_missing_file_reports_path() {
        let err = MoleculeDataset::load_npz(Path::new("/nonexistent/ds_tr.npz")).unwrap_err();
        assert_eq!(err.path(), Some("/nonexistent/ds_tr.npz"));
    }
}
