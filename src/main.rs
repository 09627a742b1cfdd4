use anyhow::Result;
use clap::Parser;
use log::info;
use prettytable::{self, format, row, Table};
use rayon::prelude::*;
use std::path;

use conv3d_tiling::common::Dtype;
use conv3d_tiling::error::status_code;
use conv3d_tiling::shape::{ConvParams, Pads, Spatial};
use conv3d_tiling::target::{PlatformInfo, SocVersion};
use conv3d_tiling::tilingdata::Conv3dTilingData;
use conv3d_tiling::Conv3dTilingEngine;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Chip whose buffer sizes are used unless overridden
    #[arg(long, value_enum, default_value_t = SocVersion::Ascend910B)]
    soc: SocVersion,

    #[arg(long)]
    aicore_num: Option<u64>,
    #[arg(long)]
    l1_size: Option<u64>,
    #[arg(long)]
    l0a_size: Option<u64>,
    #[arg(long)]
    l0b_size: Option<u64>,
    #[arg(long)]
    l0c_size: Option<u64>,
    #[arg(long)]
    ub_size: Option<u64>,
    #[arg(long)]
    bt_size: Option<u64>,
    #[arg(long)]
    l2_rate: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct ConvArgs {
    #[arg(long, short, default_value = "1")]
    batch: i64,
    #[arg(long, default_value = "16")]
    cin: i64,
    #[arg(long, default_value = "16")]
    cout: i64,
    /// Input depth, height, and width
    #[arg(long, num_args = 3, value_names = ["D", "H", "W"], default_values_t = [8, 16, 16])]
    input: Vec<i64>,
    /// Kernel depth, height, and width
    #[arg(long, num_args = 3, value_names = ["KD", "KH", "KW"], default_values_t = [3, 3, 3])]
    kernel: Vec<i64>,
    /// Stride along depth, height, and width
    #[arg(long, num_args = 3, default_values_t = [1, 1, 1])]
    stride: Vec<i64>,
    /// Dilation along depth, height, and width
    #[arg(long, num_args = 3, default_values_t = [1, 1, 1])]
    dilation: Vec<i64>,
    /// Pads as head, tail, top, bottom, left, right
    #[arg(long, num_args = 6, default_values_t = [0, 0, 0, 0, 0, 0])]
    pads: Vec<i64>,
    #[arg(long, default_value = "1")]
    groups: i64,
    #[arg(long, value_enum, default_value_t = Dtype::Bf16)]
    dtype: Dtype,
    #[arg(long, value_enum)]
    output_dtype: Option<Dtype>,
    #[arg(long, value_enum)]
    bias: Option<Dtype>,
    #[arg(long, value_enum)]
    scale: Option<Dtype>,
    /// Use the NCDHW point-wise kernels
    #[arg(long)]
    point_wise: bool,
    #[arg(long)]
    hf32: bool,
}

#[derive(clap::Subcommand)]
enum Command {
    #[command(about = "Tile one convolution")]
    Tile {
        #[command(flatten)]
        conv: ConvArgs,
        /// Write the encoded tiling data to this file
        #[arg(long)]
        payload: Option<path::PathBuf>,
    },
    #[command(about = "Tile a grid of channel counts and spatial sizes")]
    Sweep {
        #[arg(long, value_enum, default_value_t = Dtype::Bf16)]
        dtype: Dtype,
        #[arg(long, default_value = "3")]
        kernel: i64,
        #[arg(long, default_value = "8")]
        depth: i64,
        #[arg(long, num_args = 1.., default_values_t = [16, 64, 256, 1024])]
        channels: Vec<i64>,
        #[arg(long, num_args = 1.., default_values_t = [8, 32, 128, 512])]
        sizes: Vec<i64>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let engine = Conv3dTilingEngine::new(platform(&args))?;
    info!("platform: {:?}", engine.platform());
    match &args.command {
        Command::Tile { conv, payload } => {
            let params = conv_params(conv);
            let data = engine.tile(&params)?;
            print_tiling(&data);
            if let Some(path) = payload {
                let bytes = data.to_payload()?;
                std::fs::write(path, &bytes)?;
                info!("wrote {} payload bytes to {}", bytes.len(), path.display());
            }
        }
        Command::Sweep {
            dtype,
            kernel,
            depth,
            channels,
            sizes,
        } => sweep(&engine, *dtype, *kernel, *depth, channels, sizes),
    }
    Ok(())
}

fn platform(args: &Args) -> PlatformInfo {
    let mut platform = PlatformInfo::new(args.soc);
    let overrides = [
        (&mut platform.aicore_num, args.aicore_num),
        (&mut platform.l1_size, args.l1_size),
        (&mut platform.l0a_size, args.l0a_size),
        (&mut platform.l0b_size, args.l0b_size),
        (&mut platform.l0c_size, args.l0c_size),
        (&mut platform.ub_size, args.ub_size),
        (&mut platform.bt_size, args.bt_size),
        (&mut platform.l2_rate, args.l2_rate),
    ];
    for (field, value) in overrides {
        if let Some(value) = value {
            *field = value;
        }
    }
    platform
}

fn output_extent(input: i64, pad_a: i64, pad_b: i64, dilation: i64, kernel: i64, stride: i64) -> i64 {
    if stride <= 0 {
        return 0;
    }
    (input + pad_a + pad_b - dilation * (kernel - 1) - 1) / stride + 1
}

fn conv_params(conv: &ConvArgs) -> ConvParams {
    let [di, hi, wi] = [conv.input[0], conv.input[1], conv.input[2]];
    let [kd, kh, kw] = [conv.kernel[0], conv.kernel[1], conv.kernel[2]];
    let strides = Spatial {
        d: conv.stride[0],
        h: conv.stride[1],
        w: conv.stride[2],
    };
    let dilations = Spatial {
        d: conv.dilation[0],
        h: conv.dilation[1],
        w: conv.dilation[2],
    };
    let p = &conv.pads;
    let pads = Pads {
        head: p[0],
        tail: p[1],
        top: p[2],
        bottom: p[3],
        left: p[4],
        right: p[5],
    };
    let output = [
        conv.batch,
        conv.cout,
        output_extent(di, pads.head, pads.tail, dilations.d, kd, strides.d),
        output_extent(hi, pads.top, pads.bottom, dilations.h, kh, strides.h),
        output_extent(wi, pads.left, pads.right, dilations.w, kw, strides.w),
    ];
    let fmap = [conv.batch, conv.cin, di, hi, wi];
    let weight = [conv.cout, conv.cin / conv.groups.max(1), kd, kh, kw];
    let mut params = if conv.point_wise {
        ConvParams::point_wise(fmap, weight, output, conv.dtype)
    } else {
        ConvParams::new(fmap, weight, output, conv.dtype)
    }
    .with_pads(pads)
    .with_strides(strides)
    .with_dilations(dilations)
    .with_groups(conv.groups)
    .with_hf32(conv.hf32);
    if let Some(dtype) = conv.output_dtype {
        params = params.with_output_dtype(dtype);
    }
    if let Some(dtype) = conv.bias {
        params = params.with_bias(dtype);
    }
    if let Some(dtype) = conv.scale {
        params = params.with_scale(dtype);
    }
    params
}

fn print_tiling(data: &Conv3dTilingData) {
    let (r, t) = (&data.run_info, &data.tiling);
    let mut table = Table::new();
    table.set_titles(row!["", "Value"]);
    table.add_row(row![
        "block dims (batch, m, n, do, group)",
        format!(
            "{} {} {} {} {}",
            r.batch_dim, r.m_dim, r.n_dim, r.do_dim, r.group_dim
        )
    ]);
    table.add_row(row![
        "group opt (groups, cinOpt, coutOpt)",
        format!("{} {} {}", t.group_opt, t.cin_opt, t.cout_opt)
    ]);
    table.add_row(row![
        "single core (co, do, m)",
        format!(
            "{} {} {} ({})",
            t.single_core_co, t.single_core_do, t.single_core_m, t.output_order
        )
    ]);
    table.add_row(row![
        "L1 A (kAL1, mAL1, full)",
        format!("{} {} {}", t.k_al1, t.m_al1, t.al1_full_load)
    ]);
    table.add_row(row![
        "L1 B (kBL1, nBL1, full, bypass)",
        format!(
            "{} {} {} {}",
            t.k_bl1, t.n_bl1, t.bl1_full_load, t.bl1_bypass_flag
        )
    ]);
    table.add_row(row![
        "L0 (mL0, kL0, nL0)",
        format!("{} {} {}", t.m_l0, t.k_l0, t.n_l0)
    ]);
    table.add_row(row![
        "UB (mUB, nUB, load)",
        format!("{} {} {:?}", t.m_ub, t.n_ub, t.scale_and_bias_load_type)
    ]);
    table.add_row(row!["iterate order", format!("{:?}", t.iterate_mn_order)]);
    table.add_row(row!["pBufferFlag", format!("{:#08b}", t.p_buffer_flag)]);
    table.add_row(row!["bias full load", t.bias_full_load_flag]);

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table.printstd();
}

fn sweep(engine: &Conv3dTilingEngine, dtype: Dtype, kernel: i64, depth: i64, channels: &[i64], sizes: &[i64]) {
    let configs = channels
        .iter()
        .flat_map(|&cin| channels.iter().map(move |&cout| (cin, cout)))
        .flat_map(|(cin, cout)| sizes.iter().map(move |&size| (cin, cout, size)))
        .collect::<Vec<_>>();
    info!("sweeping {} configurations", configs.len());

    let results = configs
        .into_par_iter()
        .map(|(cin, cout, size)| {
            let pad = kernel / 2;
            let extent = |input| output_extent(input, pad, pad, 1, kernel, 1);
            let params = ConvParams::new(
                [1, cin, depth, size, size],
                [cout, cin, kernel, kernel, kernel],
                [1, cout, extent(depth), extent(size), extent(size)],
                dtype,
            )
            .with_pads(Pads::splat(pad));
            ((cin, cout, size), engine.tile(&params))
        })
        .collect::<Vec<_>>();

    let mut table = Table::new();
    table.set_titles(row!["Cin", "Cout", "HxW", "Status", "Cores", "mL0 kL0 nL0", "Error"]);
    for ((cin, cout, size), result) in &results {
        let status = status_code(result);
        match result {
            Ok(data) => table.add_row(row![
                cin,
                cout,
                size,
                status,
                data.run_info.core_count(),
                format!("{} {} {}", data.tiling.m_l0, data.tiling.k_l0, data.tiling.n_l0),
                ""
            ]),
            Err(err) => table.add_row(row![cin, cout, size, status, "", "", err]),
        };
    }
    table.set_format(*format::consts::FORMAT_CLEAN);
    table.printstd();
}
