//! Built-in schema tables for the supported titles.

use super::{LoadContext, RunParser};
use crate::error::Result;
use crate::layout::{ArrayMatch, FieldRuns, LayoutMatcher, Record, Schema, Shape};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, debug_span};

const SPECIES_COUNT: usize = 412;
const MOVE_COUNT: usize = 355;
const ABILITY_COUNT: usize = 78;
const TYPE_COUNT: usize = 0x12;

/// A title with built-in table locations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Title {
    /// AXVE / AXPE
    RubySapphire,
    /// BPRE
    FireRed,
    /// BPGE
    LeafGreen,
    /// BPEE
    Emerald,
}

impl fmt::Display for Title {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RubySapphire => "ruby-sapphire",
            Self::FireRed => "firered",
            Self::LeafGreen => "leafgreen",
            Self::Emerald => "emerald",
        })
    }
}

impl Title {
    /// Maps a header game code to a title
    pub fn from_game_code(code: &str) -> Option<Self> {
        match code {
            "AXVE" | "AXPE" => Some(Self::RubySapphire),
            "BPRE" => Some(Self::FireRed),
            "BPGE" => Some(Self::LeafGreen),
            "BPEE" => Some(Self::Emerald),
            _ => None,
        }
    }

    /// Picks the location for this title, falling back to `default`
    fn pick(self, default: usize, ruby_sapphire: usize, emerald: Option<usize>) -> usize {
        match self {
            Self::RubySapphire => ruby_sapphire,
            Self::Emerald => emerald.unwrap_or(default),
            Self::FireRed | Self::LeafGreen => default,
        }
    }
}

#[derive(Debug, Clone)]
enum Locate {
    /// `count` records wherever the pointer at this offset leads
    Pointer { at: usize, count: usize },
    /// The best variable-length array of this shape
    Shape(&'static str),
}

#[derive(Debug, Clone, Copy)]
enum Labels {
    /// The record's own first text field
    Own,
    /// The element with the same index in another table
    By(&'static str),
    /// Species name through the pokedex order table
    DexOrder,
}

#[derive(Debug, Clone)]
struct Job {
    name: &'static str,
    locate: Locate,
    schema: Arc<Schema>,
    labels: Labels,
}

#[derive(Debug, Clone)]
struct Table {
    name: &'static str,
    start: usize,
    stride: usize,
    records: Vec<Record>,
    labels: Labels,
}

impl Table {
    fn from_match(job: &Job, found: ArrayMatch) -> Self {
        Self {
            name: job.name,
            start: found.start,
            stride: found.stride,
            records: found.records,
            labels: job.labels,
        }
    }

    fn index_of(&self, location: usize) -> Option<usize> {
        let offset = location.checked_sub(self.start)?;
        let i = offset / self.stride;
        (offset % self.stride == 0 && i < self.records.len()).then_some(i)
    }
}

/// Reads the title's known tables and labels their elements
#[derive(Debug)]
pub struct TitleSchemas {
    title: Title,
    jobs: Vec<Job>,
    tables: Mutex<Vec<Table>>,
}

impl TitleSchemas {
    /// Prepares the table list for `title`
    pub fn new(title: Title) -> Self {
        Self {
            title,
            jobs: jobs(title),
            tables: Mutex::new(Vec::new()),
        }
    }

    /// Title the tables belong to
    pub fn title(&self) -> Title {
        self.title
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Vec<Table>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn element_name(tables: &[Table], table: &Table, i: usize) -> Option<String> {
    let lookup = |name: &str, index: usize| {
        tables
            .iter()
            .find(|t| t.name == name)
            .and_then(|t| t.records.get(index))
            .and_then(|r| r.title())
            .map(str::to_owned)
    };
    let name = match table.labels {
        Labels::Own => table.records.get(i)?.title().map(str::to_owned),
        Labels::By(other) => lookup(other, i),
        Labels::DexOrder => {
            let order = tables.iter().find(|t| t.name == "dexorder")?;
            let j = order.records.iter().position(|r| {
                r.get("index")
                    .and_then(|v| v.as_number())
                    .is_some_and(|n| n as usize == i)
            })?;
            lookup("pokename", j + 1)
        }
    };
    name.filter(|n| !n.is_empty())
}

impl RunParser for TitleSchemas {
    fn name(&self) -> &'static str {
        "tables"
    }

    fn load(&self, ctx: &mut LoadContext<'_>) -> Result<()> {
        let mut field_runs = FieldRuns::new();
        let mut tables = Vec::new();

        for job in &self.jobs {
            let _span = debug_span!("table", name = job.name).entered();
            let mut matcher = LayoutMatcher::new(
                ctx.data,
                ctx.storage,
                &mut *ctx.mapper,
                &ctx.config.charmap,
                &mut field_runs,
            )
            .min_array_len(ctx.config.min_array_len)
            .max_depth(ctx.config.max_schema_depth);

            let found = match &job.locate {
                Locate::Pointer { at, count } => matcher.read_array(*count, *at, &job.schema)?,
                Locate::Shape(shape) => {
                    matcher.find_variable_array(&Shape::parse(shape)?, &job.schema)?
                }
            };
            match found {
                Some(found) => tables.push(Table::from_match(job, found)),
                None => debug!("{} not found", job.name),
            }
        }

        debug!("{}: read {} of {} tables", self.title, tables.len(), self.jobs.len());
        *self.tables() = tables;
        Ok(())
    }

    fn find(&self, _data: &[u8], term: &str) -> Vec<usize> {
        let tables = self.tables();
        let mut hits = Vec::new();
        for table in tables.iter() {
            if table.name.eq_ignore_ascii_case(term) {
                hits.push(table.start);
            }
            for i in 0..table.records.len() {
                if element_name(&tables, table, i).is_some_and(|n| n.eq_ignore_ascii_case(term)) {
                    hits.push(table.start + i * table.stride);
                }
            }
        }
        hits
    }

    fn label(&self, location: usize) -> Option<String> {
        let tables = self.tables();
        tables.iter().find_map(|table| {
            let i = table.index_of(location)?;
            Some(
                element_name(&tables, table, i)
                    .unwrap_or_else(|| format!("{}[{}]", table.name, i)),
            )
        })
    }

    fn shortcuts(&self) -> Vec<(String, usize)> {
        self.tables()
            .iter()
            .map(|table| (table.name.to_string(), table.start))
            .collect()
    }
}

fn jobs(title: Title) -> Vec<Job> {
    let emerald = title == Title::Emerald;
    let ability_names = title.pick(0x1C0, 0x9FE64, None);

    let mut jobs = vec![
        Job {
            name: "pokename",
            locate: Locate::Pointer {
                at: title.pick(0x144, 0xFA58, None),
                count: SPECIES_COUNT,
            },
            schema: Schema::builder("pokename").text("name", 11).build(),
            labels: Labels::Own,
        },
        Job {
            name: "attackname",
            locate: Locate::Pointer {
                at: title.pick(0x148, 0x2E18C, None),
                count: MOVE_COUNT,
            },
            schema: Schema::builder("attackname").text("name", 13).build(),
            labels: Labels::Own,
        },
        Job {
            name: "abilityname",
            locate: Locate::Pointer {
                at: ability_names,
                count: ABILITY_COUNT,
            },
            schema: Schema::builder("abilityname").text("name", 13).build(),
            labels: Labels::Own,
        },
        Job {
            name: "abilitydescription",
            locate: Locate::Pointer {
                at: ability_names + 4,
                count: ABILITY_COUNT,
            },
            schema: Schema::builder("abilitydescription")
                .text_pointer("description")
                .build(),
            labels: Labels::By("abilityname"),
        },
        Job {
            name: "poketype",
            locate: Locate::Pointer {
                at: title.pick(0x309C8, 0x121B60, Some(0x59C24)),
                count: TYPE_COUNT,
            },
            schema: Schema::builder("poketype").text("name", 7).build(),
            labels: Labels::Own,
        },
        Job {
            name: "stats",
            locate: Locate::Pointer {
                at: title.pick(0x1BC, 0x10B64, None),
                count: SPECIES_COUNT,
            },
            schema: stats_schema(),
            labels: Labels::By("pokename"),
        },
        Job {
            name: "attackdata",
            locate: Locate::Pointer {
                at: title.pick(0x1CC, 0xCA54, None),
                count: MOVE_COUNT,
            },
            schema: Schema::builder("attackdata")
                .byte("effect")
                .byte("power")
                .byte_enum("type", TYPE_COUNT as u32)
                .byte("accuracy")
                .byte("pp")
                .byte("unknown1")
                .short("target")
                .word("unknown2")
                .build(),
            labels: Labels::By("attackname"),
        },
        Job {
            name: "dexorder",
            locate: Locate::Pointer {
                at: title.pick(0x4323C, 0x3F83C, Some(0x6D448)),
                count: SPECIES_COUNT - 1,
            },
            schema: Schema::builder("dexorder").short("index").build(),
            labels: Labels::Own,
        },
    ];

    let mut dexinfo = Schema::builder("dexinfo")
        .text("pokespecies", 12)
        .short("height")
        .short("weight")
        .text_pointer("description");
    if !emerald {
        dexinfo = dexinfo.text_pointer("description2");
    }
    jobs.push(Job {
        name: "dexinfo",
        locate: Locate::Shape(if emerald { "wwwwpwww" } else { "wwwwppwww" }),
        schema: dexinfo
            .padding(2)
            .short("pokemonsize")
            .short("pokemonoffset")
            .short("trainersize")
            .short("traineroffset")
            .padding(2)
            .build(),
        labels: Labels::DexOrder,
    });

    let (map_names, map_count) = match title {
        Title::RubySapphire => (0xFB550, 88),
        Title::FireRed => (0xC0C94, 109),
        Title::LeafGreen => (0xC0C68, 109),
        Title::Emerald => (0x123B44, 213),
    };
    let mapname = match title {
        Title::FireRed | Title::LeafGreen => Schema::builder("mapname"),
        Title::RubySapphire | Title::Emerald => Schema::builder("mapname").padding(4),
    };
    jobs.push(Job {
        name: "mapname",
        locate: Locate::Pointer {
            at: map_names,
            count: map_count,
        },
        schema: mapname.text_pointer("name").build(),
        labels: Labels::Own,
    });

    jobs
}

fn stats_schema() -> Arc<Schema> {
    Schema::builder("stats")
        .byte("health")
        .byte("attack")
        .byte("defense")
        .byte("speed")
        .byte("spattack")
        .byte("spdefense")
        .byte_enum("type1", TYPE_COUNT as u32)
        .byte_enum("type2", TYPE_COUNT as u32)
        .byte("catchrate")
        .byte("exp")
        .padding(3)
        .byte("item1")
        .byte("item2")
        .padding(1)
        .byte("genderratio")
        .byte("hatchspeed")
        .byte("basefriendship")
        .byte("levelup")
        .byte("egggroup1")
        .byte("egggroup2")
        .byte("ability1")
        .byte("ability2")
        .byte("runrate")
        .byte("color")
        .padding(2)
        .build()
}
