//! Typed requests parsed from URL paths and query strings, and their dispatch

use crate::annotation::{AnnotationService, ReservedIds};
use crate::context::CoreContext;
use crate::cuboid::VoxelBlock;
use crate::cutout::{Cutout, CutoutEngine};
use crate::directory::{Principal, ResourceDescriptor};
use crate::error::{BossError, ErrorCode, Result};
use crate::throttle::{MetricType, MetricUnits, ThrottleEngine};
use crate::types::{AccessMode, BoundingBox, BoundingBoxKind, Box3D};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

fn invalid_args(message: impl Into<String>) -> BossError {
    BossError::validation_with(ErrorCode::InvalidCutoutArgs, message)
}

fn parse_number<T: FromStr>(s: &str, what: &str) -> Result<T> {
    s.parse()
        .map_err(|_| invalid_args(format!("Invalid {}: {}", what, s)))
}

/// Parse a half-open `start:stop` range
pub fn parse_range(s: &str) -> Result<Range<u64>> {
    let (start, stop) = s
        .split_once(':')
        .ok_or_else(|| invalid_args(format!("Incorrect range {}; expected start:stop", s)))?;
    let start: u64 = parse_number(start, "range start")?;
    let stop: u64 = parse_number(stop, "range stop")?;
    if start >= stop {
        return Err(invalid_args(format!(
            "Range start must be less than stop, got {}",
            s
        )));
    }
    Ok(start..stop)
}

/// Parse a time argument: a single sample `t` or a `t0:t1` range
pub fn parse_time(s: &str) -> Result<Range<u64>> {
    if s.contains(':') {
        parse_range(s)
    } else {
        let t: u64 = parse_number(s, "time sample")?;
        Ok(t..t + 1)
    }
}

/// Decoded `key=value&...` query string
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query(BTreeMap<String, String>);

impl Query {
    pub fn parse(raw: &str) -> Self {
        Query(
            raw.trim_start_matches('?')
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (pair.to_string(), String::new()),
                })
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Access mode from `access-mode`, or from the older boolean `no-cache`
    pub fn access_mode(&self) -> Result<AccessMode> {
        match (self.get("access-mode"), self.get("no-cache")) {
            (Some(_), Some(_)) => Err(invalid_args(
                "access-mode and no-cache both specified; use access-mode only",
            )),
            (Some(mode), None) => match mode.to_lowercase().as_str() {
                "no-cache" => Ok(AccessMode::NoCache),
                other => other.parse(),
            },
            (None, Some(flag)) => match flag.to_lowercase().as_str() {
                "true" => Ok(AccessMode::NoCache),
                "false" => Ok(AccessMode::Cache),
                _ => Err(invalid_args(
                    "Incorrect no-cache value. Must be true or false.",
                )),
            },
            (None, None) => Ok(AccessMode::Cache),
        }
    }

    pub fn iso(&self) -> Result<bool> {
        match self.get("iso").map(str::to_lowercase).as_deref() {
            None | Some("false") => Ok(false),
            Some("true") => Ok(true),
            Some(other) => Err(invalid_args(format!(
                "Invalid iso value {}; must be true or false",
                other
            ))),
        }
    }

    /// Ids listed in `filter=<id>[,<id>]*`
    pub fn filter_ids(&self) -> Result<Option<Vec<u64>>> {
        let Some(raw) = self.get("filter") else {
            return Ok(None);
        };
        let ids = raw
            .split(',')
            .map(|id| {
                id.trim()
                    .parse::<u64>()
                    .map_err(|_| invalid_args(format!("Invalid id in filter list: {}", raw)))
            })
            .collect::<Result<Vec<_>>>()?;
        if ids.is_empty() {
            return Err(invalid_args("Filter list is empty"));
        }
        Ok(Some(ids))
    }

    pub fn bounding_box_kind(&self) -> Result<BoundingBoxKind> {
        self.get("type").map_or(Ok(BoundingBoxKind::Loose), |s| s.parse())
    }
}

/// Channel addressed by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub collection: String,
    pub experiment: String,
    pub channel: String,
}

impl ResourceRef {
    fn from_segments(segments: &[&str]) -> Self {
        Self {
            collection: segments[0].to_string(),
            experiment: segments[1].to_string(),
            channel: segments[2].to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CutoutReq {
    pub resource: ResourceRef,
    pub res: u32,
    pub bbox: Box3D,
    pub t: Range<u64>,
    pub access_mode: AccessMode,
    pub iso: bool,
    pub filter_ids: Option<Vec<u64>>,
}

impl CutoutReq {
    pub fn to_cutout(&self) -> Cutout {
        Cutout::new(self.res, self.bbox.clone())
            .with_time(self.t.clone())
            .with_iso(self.iso)
    }
}

/// Image plane of a tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Xy,
    Xz,
    Yz,
}

impl FromStr for Orientation {
    type Err = BossError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "xy" => Ok(Orientation::Xy),
            "xz" => Ok(Orientation::Xz),
            "yz" => Ok(Orientation::Yz),
            other => Err(invalid_args(format!("Invalid orientation: {}", other))),
        }
    }
}

/// Square tile addressed by tile index in one plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileReq {
    pub resource: ResourceRef,
    pub orientation: Orientation,
    pub tile_size: u64,
    pub res: u32,
    /// `[x, y, z]`; the in-plane axes count tiles, the normal axis counts voxels
    pub index: [u64; 3],
    pub t: u64,
    pub access_mode: AccessMode,
}

impl TileReq {
    pub fn to_cutout(&self) -> Result<Cutout> {
        let ts = self.tile_size;
        let [x, y, z] = self.index;
        let (corner, extent) = match self.orientation {
            Orientation::Xy => ([ts * x, ts * y, z], [ts, ts, 1]),
            Orientation::Xz => ([ts * x, y, ts * z], [ts, 1, ts]),
            Orientation::Yz => ([x, ts * y, ts * z], [1, ts, ts]),
        };
        Ok(Cutout::new(self.res, Box3D::from_corner(corner, extent)?)
            .with_time(self.t..self.t + 1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdsReq {
    pub resource: ResourceRef,
    pub res: u32,
    pub bbox: Box3D,
    pub t: Range<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundingBoxReq {
    pub resource: ResourceRef,
    pub res: u32,
    pub id: u64,
    pub kind: BoundingBoxKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CuboidsFromIdReq {
    pub resource: ResourceRef,
    pub res: u32,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveReq {
    pub resource: ResourceRef,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Cutout(CutoutReq),
    Tile(TileReq),
    Ids(IdsReq),
    BoundingBox(BoundingBoxReq),
    CuboidsFromId(CuboidsFromIdReq),
    Reserve(ReserveReq),
}

impl Request {
    /// Parse a service path such as `/cutout/col/exp/chan/0/0:512/0:512/0:16`
    pub fn from_path(path: &str, query: &str) -> Result<Self> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let query = Query::parse(query);
        let Some((&service, args)) = segments.split_first() else {
            return Err(BossError::validation("Empty request path"));
        };
        let arity = |min: usize, max: usize| -> Result<()> {
            if args.len() < min || args.len() > max {
                Err(BossError::validation(format!(
                    "Malformed {} request: {}",
                    service, path
                )))
            } else {
                Ok(())
            }
        };
        match service {
            "cutout" => {
                arity(7, 8)?;
                Ok(Request::Cutout(CutoutReq {
                    resource: ResourceRef::from_segments(args),
                    res: parse_number(args[3], "resolution")?,
                    bbox: Box3D::new(
                        parse_range(args[4])?,
                        parse_range(args[5])?,
                        parse_range(args[6])?,
                    )?,
                    t: args.get(7).map_or(Ok(0..1), |t| parse_time(t))?,
                    access_mode: query.access_mode()?,
                    iso: query.iso()?,
                    filter_ids: query.filter_ids()?,
                }))
            }
            "tile" => {
                arity(9, 10)?;
                Ok(Request::Tile(TileReq {
                    resource: ResourceRef::from_segments(args),
                    orientation: args[3].parse()?,
                    tile_size: parse_number(args[4], "tile size")?,
                    res: parse_number(args[5], "resolution")?,
                    index: [
                        parse_number(args[6], "x index")?,
                        parse_number(args[7], "y index")?,
                        parse_number(args[8], "z index")?,
                    ],
                    t: args.get(9).map_or(Ok(0), |t| parse_number(t, "time index"))?,
                    access_mode: query.access_mode()?,
                }))
            }
            "ids" => {
                arity(7, 8)?;
                Ok(Request::Ids(IdsReq {
                    resource: ResourceRef::from_segments(args),
                    res: parse_number(args[3], "resolution")?,
                    bbox: Box3D::new(
                        parse_range(args[4])?,
                        parse_range(args[5])?,
                        parse_range(args[6])?,
                    )?,
                    t: args.get(7).map_or(Ok(0..1), |t| parse_time(t))?,
                }))
            }
            "boundingbox" => {
                arity(5, 5)?;
                Ok(Request::BoundingBox(BoundingBoxReq {
                    resource: ResourceRef::from_segments(args),
                    res: parse_number(args[3], "resolution")?,
                    id: parse_number(args[4], "id")?,
                    kind: query.bounding_box_kind()?,
                }))
            }
            "cuboidsfromid" => {
                arity(5, 5)?;
                Ok(Request::CuboidsFromId(CuboidsFromIdReq {
                    resource: ResourceRef::from_segments(args),
                    res: parse_number(args[3], "resolution")?,
                    id: parse_number(args[4], "id")?,
                }))
            }
            "reserve" => {
                arity(4, 4)?;
                Ok(Request::Reserve(ReserveReq {
                    resource: ResourceRef::from_segments(args),
                    count: parse_number(args[3], "count")?,
                }))
            }
            other => Err(BossError::validation(format!("Unknown service {}", other))),
        }
    }

    pub fn resource(&self) -> &ResourceRef {
        match self {
            Request::Cutout(r) => &r.resource,
            Request::Tile(r) => &r.resource,
            Request::Ids(r) => &r.resource,
            Request::BoundingBox(r) => &r.resource,
            Request::CuboidsFromId(r) => &r.resource,
            Request::Reserve(r) => &r.resource,
        }
    }
}

/// Result of a handled request
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Voxels(VoxelBlock),
    /// Cutout stored
    Created,
    Ids(Vec<u64>),
    BoundingBox(BoundingBox),
    CuboidKeys(Vec<String>),
    Reserved(ReservedIds),
}

impl Response {
    pub fn http_status(&self) -> u16 {
        match self {
            Response::Created => 201,
            _ => 200,
        }
    }
}

/// Routes typed requests to the cutout and annotation services
#[derive(Clone)]
pub struct RequestHandler {
    ctx: Arc<CoreContext>,
    cutout: CutoutEngine,
    annotation: AnnotationService,
}

impl RequestHandler {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self {
            cutout: CutoutEngine::new(ctx.clone()),
            annotation: AnnotationService::new(ctx.clone()),
            ctx,
        }
    }

    async fn resolve(&self, r: &ResourceRef) -> Result<ResourceDescriptor> {
        self.ctx
            .directory
            .resolve_names(&r.collection, &r.experiment, &r.channel)
            .await
    }

    async fn charge(
        &self,
        api: &str,
        mtype: MetricType,
        principal: &Principal,
        resource: &ResourceDescriptor,
        cutout: &Cutout,
    ) -> Result<()> {
        let [t, z, y, x] = cutout.shape();
        let bytes = (t * z * y * x * resource.dtype().size_in_bytes()) as i64;
        ThrottleEngine::from_context(&self.ctx)
            .check(api, mtype, &principal.username, bytes, MetricUnits::Bytes)
            .await
    }

    /// Handle `request`; a cutout with `body` is a write
    pub async fn handle(
        &self,
        principal: &Principal,
        request: &Request,
        body: Option<&VoxelBlock>,
    ) -> Result<Response> {
        let resource = self.resolve(request.resource()).await?;
        debug!(resource = %resource.boss_key(), user = %principal.username, "handling request");
        match request {
            Request::Cutout(req) => {
                let cutout = req.to_cutout();
                match body {
                    Some(data) => {
                        self.charge("cutout", MetricType::Ingress, principal, &resource, &cutout)
                            .await?;
                        self.cutout.write(&resource, &cutout, data).await?;
                        Ok(Response::Created)
                    }
                    None => {
                        self.charge("cutout", MetricType::Egress, principal, &resource, &cutout)
                            .await?;
                        let block = self
                            .cutout
                            .read(&resource, &cutout, req.access_mode, req.filter_ids.as_deref())
                            .await?;
                        Ok(Response::Voxels(block))
                    }
                }
            }
            Request::Tile(req) => {
                let cutout = req.to_cutout()?;
                self.charge("tile", MetricType::Egress, principal, &resource, &cutout)
                    .await?;
                let block = self
                    .cutout
                    .read(&resource, &cutout, req.access_mode, None)
                    .await?;
                Ok(Response::Voxels(block))
            }
            Request::Ids(req) => {
                let cutout = Cutout::new(req.res, req.bbox.clone()).with_time(req.t.clone());
                Ok(Response::Ids(
                    self.annotation.ids_in_region(&resource, &cutout).await?,
                ))
            }
            Request::BoundingBox(req) => Ok(Response::BoundingBox(
                self.annotation
                    .bounding_box(&resource, req.res, req.id, req.kind)
                    .await?,
            )),
            Request::CuboidsFromId(req) => Ok(Response::CuboidKeys(
                self.annotation
                    .cuboids_from_id(&resource, req.res, req.id)
                    .await?,
            )),
            Request::Reserve(req) => Ok(Response::Reserved(
                self.annotation.reserve_ids(&resource, req.count).await?,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::directory::{ChannelSpec, MemoryDirectory};
    use crate::layout::{CoordinateFrame, CubeSize};
    use ndarray::Array4;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("10:20").unwrap(), 10..20);
        assert_eq!(
            parse_range("20:10").unwrap_err().code(),
            ErrorCode::InvalidCutoutArgs
        );
        assert!(parse_range("10").is_err());
        assert!(parse_range("a:5").is_err());
        assert_eq!(parse_time("3").unwrap(), 3..4);
        assert_eq!(parse_time("0:5").unwrap(), 0..5);
    }

    #[test]
    fn test_access_mode_from_query() {
        assert_eq!(Query::parse("").access_mode().unwrap(), AccessMode::Cache);
        assert_eq!(
            Query::parse("access-mode=raw").access_mode().unwrap(),
            AccessMode::Raw
        );
        assert_eq!(
            Query::parse("access-mode=no-cache").access_mode().unwrap(),
            AccessMode::NoCache
        );
        assert_eq!(
            Query::parse("no-cache=True").access_mode().unwrap(),
            AccessMode::NoCache
        );
        assert_eq!(
            Query::parse("no-cache=false").access_mode().unwrap(),
            AccessMode::Cache
        );
        assert!(Query::parse("no-cache=maybe").access_mode().is_err());
        let err = Query::parse("no-cache=true&access-mode=raw")
            .access_mode()
            .unwrap_err();
        assert_eq!(err.http_status(), 400);
    }

    #[test]
    fn test_filter_and_iso() {
        let q = Query::parse("?filter=1,5,9&iso=TRUE");
        assert_eq!(q.filter_ids().unwrap(), Some(vec![1, 5, 9]));
        assert!(q.iso().unwrap());
        assert!(Query::parse("filter=1,x").filter_ids().is_err());
        assert_eq!(Query::parse("").filter_ids().unwrap(), None);
    }

    #[test]
    fn test_cutout_path() {
        let req = Request::from_path("/cutout/col1/exp1/em/0/0:512/0:256/0:16/", "access-mode=raw")
            .unwrap();
        let Request::Cutout(req) = req else {
            panic!("expected a cutout request")
        };
        assert_eq!(req.resource.channel, "em");
        assert_eq!(req.bbox, Box3D::new(0..512, 0..256, 0..16).unwrap());
        assert_eq!(req.t, 0..1);
        assert_eq!(req.access_mode, AccessMode::Raw);

        let Request::Cutout(req) =
            Request::from_path("cutout/c/e/ch/1/0:8/0:8/0:1/2:4", "").unwrap()
        else {
            panic!("expected a cutout request")
        };
        assert_eq!(req.t, 2..4);
        assert!(Request::from_path("cutout/c/e/ch/1/0:8/0:8", "").is_err());
    }

    #[test]
    fn test_other_services() {
        assert_eq!(
            Request::from_path("reserve/c/e/anno/10", "").unwrap(),
            Request::Reserve(ReserveReq {
                resource: ResourceRef {
                    collection: "c".into(),
                    experiment: "e".into(),
                    channel: "anno".into(),
                },
                count: 10,
            })
        );
        let Request::BoundingBox(bb) =
            Request::from_path("boundingbox/c/e/anno/0/42", "type=tight").unwrap()
        else {
            panic!("expected a bounding box request")
        };
        assert_eq!(bb.kind, BoundingBoxKind::Tight);
        assert_eq!(bb.id, 42);
        assert!(Request::from_path("boundingbox/c/e/anno/0/42", "type=snug").is_err());
        assert!(matches!(
            Request::from_path("ids/c/e/anno/0/0:8/0:8/0:1", "").unwrap(),
            Request::Ids(_)
        ));
        assert!(matches!(
            Request::from_path("cuboidsfromid/c/e/anno/0/7", "").unwrap(),
            Request::CuboidsFromId(_)
        ));
        assert!(Request::from_path("meta/c/e/anno", "").is_err());
        assert!(Request::from_path("", "").is_err());
    }

    #[test]
    fn test_tile_to_cutout() {
        let Request::Tile(tile) = Request::from_path("tile/c/e/em/xz/16/0/1/3/2", "").unwrap() else {
            panic!("expected a tile request")
        };
        let cutout = tile.to_cutout().unwrap();
        assert_eq!(cutout.bbox, Box3D::new(16..32, 3..4, 32..48).unwrap());
        assert_eq!(cutout.t, 0..1);
        assert!(Request::from_path("tile/c/e/em/zz/16/0/1/3/2", "").is_err());
    }

    #[tokio::test]
    async fn test_handler_round_trip() {
        let directory = Arc::new(MemoryDirectory::new());
        let frame = CoordinateFrame::new(0..64, 0..64, 0..8, [4.0, 4.0, 35.0]).unwrap();
        directory
            .create_channel(ChannelSpec::image("col1", "exp1", "em", frame.clone()))
            .unwrap();
        directory
            .create_channel(ChannelSpec::annotation("col1", "exp1", "anno", frame))
            .unwrap();
        let mut config = CoreConfig::default();
        config.cuboid.cube_size = CubeSize::new(16, 16, 4);
        let ctx = CoreContext::builder(config)
            .directory(directory)
            .build()
            .unwrap();
        let handler = RequestHandler::new(ctx);
        let alice = Principal::user("alice");

        let write = Request::from_path("cutout/col1/exp1/em/0/0:16/0:16/0:2", "").unwrap();
        let data = VoxelBlock::from_typed(&Array4::from_elem((1, 2, 16, 16), 9u8));
        let response = handler.handle(&alice, &write, Some(&data)).await.unwrap();
        assert_eq!(response.http_status(), 201);

        let tile = Request::from_path("tile/col1/exp1/em/xy/16/0/0/0/1", "").unwrap();
        let Response::Voxels(block) = handler.handle(&alice, &tile, None).await.unwrap() else {
            panic!("expected voxels")
        };
        assert_eq!(block.shape(), [1, 1, 16, 16]);
        assert!(block.typed::<u8>().unwrap().iter().all(|v| *v == 9));

        let reserve = Request::from_path("reserve/col1/exp1/anno/5", "").unwrap();
        let Response::Reserved(ids) = handler.handle(&alice, &reserve, None).await.unwrap() else {
            panic!("expected reserved ids")
        };
        assert_eq!((ids.start_id, ids.count), (1, 5));

        let filtered = Request::from_path("cutout/col1/exp1/em/0/0:16/0:16/0:2", "filter=1").unwrap();
        let err = handler.handle(&alice, &filtered, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidCutoutArgs);
    }
}
