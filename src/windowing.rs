//! Нарезка ряда на непересекающиеся группы и подготовка пар (история, цель) для модели.

use std::ops::Range;

use itertools::Itertools;

use crate::constants::{DEFAULT_HOLDOUT, DEFAULT_PERIOD_LENGTH};
use crate::error::{ForecastError, Result};
use crate::normalization::point_relative_normalize;

/// Параметры нарезки, общие для окон и для трекера опорной точки.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowSettings {
    pub group_size: usize,
    /// Сколько первых наблюдений пропустить перед нарезкой.
    pub start: usize,
    /// Сколько последних групп не участвует в обучении.
    pub holdout: usize,
    pub normalize: bool,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            group_size: DEFAULT_PERIOD_LENGTH,
            start: 0,
            holdout: DEFAULT_HOLDOUT,
            normalize: true,
        }
    }
}

/// Набор групп одинаковой длины, форма `(1, len, group_size)`; хранится плоско по строкам.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupCollection {
    group_size: usize,
    values: Vec<f64>,
}

impl GroupCollection {
    pub fn new(group_size: usize, values: Vec<f64>) -> Result<Self> {
        if group_size == 0 {
            return Err(ForecastError::InvalidGroupSize);
        }
        if values.len() % group_size != 0 {
            return Err(ForecastError::LengthMismatch {
                expected: values.len().next_multiple_of(group_size),
                actual: values.len(),
            });
        }
        Ok(Self { group_size, values })
    }

    pub const fn empty(group_size: usize) -> Self {
        Self {
            group_size,
            values: Vec::new(),
        }
    }

    pub const fn group_size(&self) -> usize {
        self.group_size
    }

    /// Количество групп.
    pub const fn len(&self) -> usize {
        self.values.len() / self.group_size
    }

    pub const fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub const fn shape(&self) -> (usize, usize, usize) {
        (1, self.len(), self.group_size)
    }

    pub fn groups(&self) -> impl Iterator<Item = &[f64]> {
        self.values.chunks_exact(self.group_size)
    }

    pub fn group(&self, idx: usize) -> Option<&[f64]> {
        self.groups().nth(idx)
    }

    pub fn last(&self) -> Option<&[f64]> {
        self.groups().last()
    }

    /// Подмножество групп `range` (индексы групп, не наблюдений).
    pub fn slice(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Self {
            group_size: self.group_size,
            values: self.values[start * self.group_size..end * self.group_size].to_vec(),
        }
    }

    pub fn as_flat(&self) -> &[f64] {
        &self.values
    }
}

/// История `x` формы `(1, n - 1, g)` и цель `y` формы `(1, g)`.
#[derive(Clone, Debug, PartialEq)]
pub struct SupervisedPair {
    pub x: GroupCollection,
    pub y: Vec<f64>,
}

/// Результат подготовки обучающих окон.
#[derive(Clone, Debug, PartialEq)]
pub struct TrainingWindows {
    /// Все сохранённые группы, включая отложенные.
    pub groups: GroupCollection,
    pub pair: SupervisedPair,
    /// Индексы отложенных групп внутри `groups`.
    pub holdout: Range<usize>,
}

/// Сколько наблюдений после `start` покрываются целыми группами.
/// Этим же числом пользуется трекер опорной точки, поэтому границы окон совпадают.
pub const fn retained_len(len: usize, group_size: usize, start: usize) -> usize {
    if group_size == 0 {
        return 0;
    }
    len.saturating_sub(start) / group_size * group_size
}

/// Нарезает ряд на группы по `group_size` начиная с `start`; неполный хвост отбрасывается.
pub fn create_groups(
    series: &[f64],
    group_size: usize,
    start: usize,
    normalize: bool,
) -> Result<GroupCollection> {
    if group_size == 0 {
        return Err(ForecastError::InvalidGroupSize);
    }
    let tail = series.get(start..).unwrap_or_default();
    let values = tail
        .chunks_exact(group_size)
        .map(|chunk| {
            if normalize {
                point_relative_normalize(chunk)
            } else {
                Ok(chunk.to_vec())
            }
        })
        .flatten_ok()
        .collect::<Result<Vec<f64>>>()?;
    GroupCollection::new(group_size, values)
}

/// Делит группы на историю (все, кроме последней) и цель (последняя).
/// Одна группа даёт пустую историю; проверять её должен вызывающий.
pub fn split_supervised(groups: &GroupCollection) -> Result<SupervisedPair> {
    let count = groups.len();
    let y = groups
        .last()
        .ok_or(ForecastError::InsufficientData {
            required: groups.group_size(),
            available: 0,
        })?
        .to_vec();
    Ok(SupervisedPair {
        x: groups.slice(0..count - 1),
        y,
    })
}

/// Полный прямой путь: группы, отложенная часть и пара для обучения.
pub fn prepare_training(series: &[f64], settings: &WindowSettings) -> Result<TrainingWindows> {
    let groups = create_groups(series, settings.group_size, settings.start, settings.normalize)?;
    let required_groups = settings.holdout + 2;
    if groups.len() < required_groups {
        return Err(ForecastError::InsufficientData {
            required: settings.start + required_groups * settings.group_size,
            available: series.len(),
        });
    }

    let training_count = groups.len() - settings.holdout;
    let pair = split_supervised(&groups.slice(0..training_count))?;
    tracing::debug!(
        groups = groups.len(),
        training = training_count,
        holdout = settings.holdout,
        discarded = series.len() - settings.start.min(series.len())
            - retained_len(series.len(), settings.group_size, settings.start),
        "Prepared training windows"
    );

    Ok(TrainingWindows {
        holdout: training_count..groups.len(),
        groups,
        pair,
    })
}
